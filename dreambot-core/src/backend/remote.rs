//! Client for a generation server speaking `POST /v1/images/generations`.
//!
//! The request body is `{prompt, width, height, steps, guidance, seed}` (plus
//! `init_image`/`strength` for img2img) and the response is
//! `{"image": "<base64 PNG>"}`.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::{prelude::BASE64_STANDARD, Engine};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::debug;

use crate::{packager, GenerationRequest, ImageModel};

const GENERATIONS_PATH: &str = "/v1/images/generations";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Serialize, Debug, PartialEq)]
struct WireRequest<'a> {
    prompt: &'a str,
    width: u32,
    height: u32,
    steps: usize,
    guidance: f64,
    seed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    init_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    strength: Option<f64>,
}

#[derive(Deserialize)]
struct WireResponse {
    image: String,
}

pub struct RemoteModel {
    client: reqwest::Client,
    endpoint: String,
    runtime: Handle,
}

impl RemoteModel {
    /// Must be called from inside a tokio runtime; requests are driven on it.
    pub fn new(base_url: &str) -> Result<Self> {
        let runtime = Handle::try_current().context("remote backend needs a tokio runtime")?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), GENERATIONS_PATH),
            runtime,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn wire_request<'a>(request: &'a GenerationRequest, seed: u64) -> Result<WireRequest<'a>> {
        let (init_image, strength) = match &request.source {
            Some(source) => {
                let png = packager::encode_png(&source.image)?;
                (Some(BASE64_STANDARD.encode(png)), Some(source.strength))
            }
            None => (None, None),
        };
        Ok(WireRequest {
            prompt: &request.prompt,
            width: request.width,
            height: request.height,
            steps: request.steps,
            guidance: request.guidance,
            seed,
            init_image,
            strength,
        })
    }

    async fn post(&self, body: &WireRequest<'_>) -> Result<DynamicImage> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(body)
            .send()
            .await
            .with_context(|| format!("failed to reach {}", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("generation server returned {status}: {text}");
        }

        let payload: WireResponse = response
            .json()
            .await
            .context("generation server sent an unexpected response")?;
        decode_image(&payload.image)
    }
}

fn decode_image(encoded: &str) -> Result<DynamicImage> {
    let bytes = BASE64_STANDARD
        .decode(encoded.trim())
        .context("image is not valid base64")?;
    image::load_from_memory(&bytes).context("image could not be decoded")
}

impl ImageModel for RemoteModel {
    fn generate(&mut self, request: &GenerationRequest, seed: u64) -> Result<DynamicImage> {
        let body = Self::wire_request(request, seed)?;
        debug!("POST {} (seed {})", self.endpoint, seed);
        // Called from a blocking worker thread, so blocking on the runtime is allowed.
        self.runtime.block_on(self.post(&body))
    }

    fn name(&self) -> &str {
        &self.endpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;
    use crate::{Error, Gateway, SourceImage};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn png_base64(width: u32, height: u32) -> String {
        let img = DynamicImage::new_rgb8(width, height);
        BASE64_STANDARD.encode(packager::encode_png(&img).unwrap())
    }

    /// Answers every connection with `status` and `body`, returning the request bodies seen.
    async fn serve(status: &'static str, body: String) -> (String, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                // read headers, then as much body as Content-Length says
                let request = loop {
                    let n = socket.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break String::from_utf8_lossy(&buf).into_owned();
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    let text = String::from_utf8_lossy(&buf).into_owned();
                    if let Some(split) = text.find("\r\n\r\n") {
                        let length = text[..split]
                            .lines()
                            .find_map(|l| {
                                let (k, v) = l.split_once(':')?;
                                k.eq_ignore_ascii_case("content-length")
                                    .then(|| v.trim().parse::<usize>().ok())
                                    .flatten()
                            })
                            .unwrap_or(0);
                        if buf.len() >= split + 4 + length {
                            break text[split + 4..].to_string();
                        }
                    }
                };
                tx.send(request).unwrap();
                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            }
        });
        (format!("http://{addr}"), rx)
    }

    #[test]
    fn test_wire_request_shape() {
        let mut req = GenerationRequest::new("a fox");
        let body = serde_json::to_value(RemoteModel::wire_request(&req, 9).unwrap()).unwrap();
        assert_eq!(body["prompt"], "a fox");
        assert_eq!(body["seed"], 9);
        assert_eq!(body["width"], 512);
        assert!(body.get("init_image").is_none());

        req.source = Some(SourceImage {
            image: DynamicImage::new_rgb8(4, 4),
            strength: 0.5,
        });
        let body = serde_json::to_value(RemoteModel::wire_request(&req, 9).unwrap()).unwrap();
        assert_eq!(body["strength"], 0.5);
        assert!(body["init_image"].as_str().unwrap().len() > 10);
    }

    #[tokio::test]
    async fn test_endpoint_from_base_url() {
        let model = RemoteModel::new("http://gpu-box:8000/").unwrap();
        assert_eq!(model.endpoint(), "http://gpu-box:8000/v1/images/generations");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_generates_through_gateway() {
        let body = serde_json::json!({ "image": png_base64(8, 8) }).to_string();
        let (url, mut seen) = serve("200 OK", body).await;
        let gateway = Gateway::new(Box::new(RemoteModel::new(&url).unwrap()), &LimitsConfig::default());

        let mut req = GenerationRequest::new("lighthouse");
        req.count = 2;
        req.seed = Some(100);
        let result = gateway.generate(req).await.unwrap();

        assert_eq!(result.seeds(), vec![100, 101]);
        assert_eq!(result.images[0].image.width(), 8);
        let first: serde_json::Value = serde_json::from_str(&seen.recv().await.unwrap()).unwrap();
        assert_eq!(first["seed"], 100);
        assert_eq!(first["prompt"], "lighthouse");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_server_oom_is_reported() {
        let (url, _seen) = serve(
            "500 Internal Server Error",
            "Error: CUDA out of memory".to_string(),
        )
        .await;
        let gateway = Gateway::new(Box::new(RemoteModel::new(&url).unwrap()), &LimitsConfig::default());
        let result = gateway.generate(GenerationRequest::new("x")).await;
        assert!(matches!(result, Err(Error::OutOfMemory(_))));
    }
}
