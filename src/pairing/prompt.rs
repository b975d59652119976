use std::io::{self, BufRead, Write};

use super::{PairChoice, PairChooser, PairRequest, image_dimensions, open_external};

/// Asks on the terminal after opening both images in the system viewer.
#[derive(Debug, Default, Clone, Copy)]
pub struct PromptChooser;

impl PairChooser for PromptChooser {
    fn name(&self) -> &str {
        "prompt"
    }

    fn choose(&self, request: &PairRequest<'_>) -> PairChoice {
        let mut out = io::stdout().lock();
        describe(request, &mut out).ok();
        println!("\nOpening images in system viewer...");
        for (i, path) in request.exported.iter().enumerate() {
            println!("Opening Image {}...", i + 1);
            if let Err(e) = open_external(path) {
                println!("Could not open images automatically: {e}");
                println!("Please manually open the images to view them.");
                break;
            }
        }
        ask(request, &mut io::stdin().lock(), &mut out)
    }

    fn is_interactive(&self) -> bool {
        true
    }
}

fn describe(request: &PairRequest<'_>, out: &mut impl Write) -> io::Result<()> {
    writeln!(
        out,
        "\n--- Conversation {}, Message ID {} ---",
        request.conversation_id, request.file_id
    )?;
    if let Some(progress) = request.progress_text() {
        writeln!(out, "Progress: {progress}")?;
    }
    for (i, path) in request.exported.iter().enumerate() {
        let name = path.file_name().unwrap_or_default().to_string_lossy();
        match image_dimensions(path).filter(|&(_, h)| h > 0) {
            Some((w, h)) => writeln!(
                out,
                "Image {}: {name} ({w}x{h}, {:.2} ratio)",
                i + 1,
                w as f64 / h as f64
            )?,
            None => writeln!(out, "Image {}: {name}", i + 1)?,
        }
    }
    Ok(())
}

/// Read `1`, `2` or `3` until a valid answer arrives. EOF or an I/O error
/// skips.
fn ask(
    request: &PairRequest<'_>,
    input: &mut impl BufRead,
    out: &mut impl Write,
) -> PairChoice {
    read_choice(request, input, out).unwrap_or_else(|e| {
        log::warn!("Prompt failed, skipping composite: {e}");
        PairChoice::Skip
    })
}

fn read_choice(
    request: &PairRequest<'_>,
    input: &mut impl BufRead,
    out: &mut impl Write,
) -> io::Result<PairChoice> {
    writeln!(out, "\nWhich image should be the SELFIE VIEW (front camera/overlay)?")?;
    writeln!(out, "1. Image 1\n2. Image 2\n3. Skip composite creation")?;

    let mut line = String::new();
    loop {
        write!(out, "Enter choice (1, 2, or 3): ")?;
        out.flush()?;
        line.clear();
        if input.read_line(&mut line)? == 0 {
            writeln!(out, "\nSkipping composite creation...")?;
            return Ok(PairChoice::Skip);
        }
        match line.trim() {
            "1" => return Ok(request.overlay_at(0)),
            "2" => return Ok(request.overlay_at(1)),
            "3" => return Ok(PairChoice::Skip),
            _ => writeln!(out, "Please enter 1, 2, or 3")?,
        }
    }
}
