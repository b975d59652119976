use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::future::Future;
use std::io;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::{PairChoice, PairChooser, PairRequest, open_external};
use crate::pipeline::ImageKind;

const MAX_REQUEST_LINE: usize = 8192;

/// Serves a one-shot chooser page on `127.0.0.1` and waits for the click.
#[derive(Debug, Clone)]
pub struct WebChooser {
    timeout: Duration,
    open_browser: bool,
}

impl WebChooser {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            open_browser: true,
        }
    }
}

/// What the page reported back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Answer {
    Overlay(usize),
    Skip,
}

impl PairChooser for WebChooser {
    fn name(&self) -> &str {
        "web"
    }

    fn choose(&self, request: &PairRequest<'_>) -> PairChoice {
        let page = match render_page(request) {
            Ok(page) => page,
            Err(e) => {
                log::warn!("Could not build chooser page: {e}");
                return PairChoice::Skip;
            }
        };

        let session = async {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let url = format!("http://{}/", listener.local_addr()?);
            println!(
                "Opening web UI for conversation {}, message {}...",
                request.conversation_id, request.file_id
            );
            println!("Make your selection in the web browser (click image or press 1/2/S): {url}");
            if self.open_browser {
                if let Err(e) = open_external(&url) {
                    log::warn!("Could not open browser: {e}");
                }
            }
            Ok::<_, io::Error>(serve(listener, &page, self.timeout).await)
        };

        match block_on(session).and_then(|answer| answer) {
            Ok(Some(Answer::Overlay(i))) => request.overlay_at(i),
            Ok(Some(Answer::Skip)) => PairChoice::Skip,
            Ok(None) => {
                println!("Timeout waiting for selection, skipping...");
                PairChoice::Skip
            }
            Err(e) => {
                log::warn!("Web chooser failed: {e}");
                PairChoice::Skip
            }
        }
    }

    fn is_interactive(&self) -> bool {
        true
    }
}

/// Runs `fut` on the ambient runtime when called from a blocking thread,
/// otherwise on a private one.
fn block_on<F: Future>(fut: F) -> io::Result<F::Output> {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => Ok(handle.block_on(fut)),
        Err(_) => Ok(tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
            .block_on(fut)),
    }
}

/// Serve the page until an answer arrives. `None` on timeout.
async fn serve(listener: TcpListener, page: &str, timeout: Duration) -> Option<Answer> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let (stream, _) = match tokio::time::timeout_at(deadline, listener.accept()).await {
            Err(_) => return None,
            Ok(Err(e)) => {
                log::debug!("Accept failed: {e}");
                continue;
            }
            Ok(Ok(conn)) => conn,
        };
        match tokio::time::timeout_at(deadline, handle(stream, page)).await {
            Err(_) => return None,
            Ok(Ok(Some(answer))) => return Some(answer),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => log::debug!("Chooser request failed: {e}"),
        }
    }
}

async fn handle(mut stream: TcpStream, page: &str) -> io::Result<Option<Answer>> {
    let request_line = read_request_line(&mut stream).await?;
    let target = request_line.split_whitespace().nth(1).unwrap_or("/");

    let (status, content_type, body, answer) = match target {
        "/" | "/index.html" => ("200 OK", "text/html; charset=utf-8", page, None),
        "/choice/1" => ("200 OK", "text/plain", "ok", Some(Answer::Overlay(0))),
        "/choice/2" => ("200 OK", "text/plain", "ok", Some(Answer::Overlay(1))),
        "/choice/skip" => ("200 OK", "text/plain", "ok", Some(Answer::Skip)),
        _ => ("404 Not Found", "text/plain", "Not Found", None),
    };

    let header = format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {}\r\n\
         Cache-Control: no-store\r\n\
         Connection: close\r\n\
         \r\n",
        body.len()
    );
    stream.write_all(header.as_bytes()).await?;
    stream.write_all(body.as_bytes()).await?;
    stream.shutdown().await.ok();
    Ok(answer)
}

/// Read until the end of the request line, however the bytes arrive.
async fn read_request_line(stream: &mut TcpStream) -> io::Result<String> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    while !buf.windows(2).any(|w| w == b"\r\n") && buf.len() < MAX_REQUEST_LINE {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let line = buf.split(|&b| b == b'\n').next().unwrap_or_default();
    Ok(String::from_utf8_lossy(line).trim_end().to_string())
}

fn data_uri(path: &Path) -> io::Result<String> {
    let bytes = std::fs::read(path)?;
    let mime = ImageKind::detect(path)
        .or_else(|| ImageKind::from_path(path))
        .map_or("application/octet-stream", |k| k.mime_type());
    Ok(format!("data:{mime};base64,{}", STANDARD.encode(bytes)))
}

fn render_page(request: &PairRequest<'_>) -> io::Result<String> {
    let img1 = data_uri(request.exported[0])?;
    let img2 = data_uri(request.exported[1])?;
    let name = |p: &Path| {
        p.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    };
    let progress = request
        .progress_text()
        .map(|p| format!(r#"<div class="progress">{p}</div>"#))
        .unwrap_or_default();

    Ok(format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Choose selfie view</title>
<style>
body {{ font-family: Arial, sans-serif; margin: 20px; background: #f0f0f0; }}
.container {{ max-width: 1200px; margin: 0 auto; background: white; padding: 20px; border-radius: 10px; }}
.progress {{ background: #e9ecef; padding: 10px; border-radius: 5px; margin: 10px 0; }}
.images {{ display: flex; gap: 20px; }}
.image-container {{ flex: 1; border: 3px solid #ddd; border-radius: 10px; padding: 10px; cursor: pointer; text-align: center; }}
.image-container.selected {{ border-color: #28a745; background: #f8fff8; }}
.image-container img {{ max-width: 100%; max-height: 70vh; }}
button {{ padding: 10px 20px; margin: 10px 5px; border: none; border-radius: 5px; cursor: pointer; background: #6c757d; color: white; }}
</style>
</head>
<body>
<div class="container">
<h2>Conversation {conversation}, message {file_id}</h2>
{progress}
<p class="instruction"><strong>Click on the image that should be the SELFIE VIEW (front camera/overlay)</strong><br>Keys: 1, 2, S to skip</p>
<div class="images">
<div class="image-container" id="img1" onclick="send('1')"><img src="{img1}"><p>Image 1: {name1}</p></div>
<div class="image-container" id="img2" onclick="send('2')"><img src="{img2}"><p>Image 2: {name2}</p></div>
</div>
<div class="buttons"><button onclick="send('skip')">Skip Composite</button></div>
<div id="result"></div>
</div>
<script>
let sent = false;
function send(value) {{
  if (sent) return;
  sent = true;
  if (value !== 'skip') document.getElementById('img' + value).classList.add('selected');
  fetch('/choice/' + value).then(function () {{
    document.getElementById('result').innerHTML = value === 'skip'
      ? '<p>Composite creation skipped. You can close this window.</p>'
      : '<p>Image ' + value + ' selected as SELFIE VIEW. You can close this window.</p>';
  }});
}}
document.addEventListener('keydown', function (e) {{
  if (e.key === '1' || e.key === '2') send(e.key);
  else if (e.key === 's' || e.key === 'S') send('skip');
}});
</script>
</body>
</html>
"#,
        conversation = request.conversation_id,
        file_id = request.file_id,
        name1 = name(request.exported[0]),
        name2 = name(request.exported[1]),
    ))
}
