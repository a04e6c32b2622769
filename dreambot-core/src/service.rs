//! The bot itself: route a message, run it, answer it.

use std::path::PathBuf;

use chrono::Local;
use image::DynamicImage;
use tracing::{error, info, warn};

use crate::packager::{self, UploadPacket};
use crate::router::{self, AttachmentRef, Command, Invocation, Router};
use crate::{images, ChatReply, Config, Error, Gateway, GenerationRequest, GenerationResult, Result, SourceImage};

/// Longest prompt echoed back in a message; chat platforms cap message length.
const PROMPT_ECHO_CHARS: usize = 300;

pub struct DreamBot {
    router: Router,
    gateway: Gateway,
    http: reqwest::Client,
    download_path: PathBuf,
    output_dir: Option<PathBuf>,
    max_pixels: u64,
    upload_ceiling: usize,
}

impl DreamBot {
    pub fn new(config: &Config, gateway: Gateway) -> Self {
        Self {
            router: Router::new(&config.options.command_prefix, config.limits.max_pixels),
            gateway,
            http: reqwest::Client::new(),
            download_path: config.files.download_path.clone(),
            output_dir: config.files.output_dir.clone(),
            max_pixels: config.limits.max_pixels,
            upload_ceiling: config.limits.upload_ceiling,
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Handles one incoming message. Returns `Ok(false)` if it was not a command.
    ///
    /// Failures caused by the request are answered in the channel and are not
    /// errors here; `Err` means the reply itself could not be delivered.
    pub async fn handle(&self, invocation: &Invocation, reply: &dyn ChatReply) -> anyhow::Result<bool> {
        let Some(routed) = self.router.route(invocation) else {
            return Ok(false);
        };

        let outcome = match routed {
            Ok(command) => self.run(command, invocation, reply).await,
            Err(e) => Err(e),
        };

        if let Err(e) = outcome {
            if e.is_user_error() {
                info!("rejected command from {}: {}", invocation.author, e);
            } else {
                error!("command from {} failed: {}", invocation.author, e);
            }
            reply.say(&format!("Error: {e}")).await?;
        }
        Ok(true)
    }

    async fn run(&self, command: Command, invocation: &Invocation, reply: &dyn ChatReply) -> Result<()> {
        match command {
            Command::Echo(text) => {
                say(reply, &format!("ECHO: {text}")).await;
                Ok(())
            }
            Command::Help => {
                say(reply, &router::help(self.router.prefix())).await;
                Ok(())
            }
            Command::Flip(attachment) => self.flip(&attachment, reply).await,
            Command::Txt2Img(request) => self.generate(request, reply).await,
            Command::Img2Img {
                mut request,
                strength,
                source,
            } => {
                let (image, path) = self.fetch_source(&source).await?;
                info!("img2img source from {} saved to {}", invocation.author, path.display());
                request.source = Some(SourceImage { image, strength });
                self.generate(request, reply).await
            }
        }
    }

    async fn fetch_source(&self, source: &AttachmentRef) -> Result<(DynamicImage, PathBuf)> {
        let filename = images::attachment_filename(&source.filename, &source.url);
        images::save_from_url(
            &self.http,
            &source.url,
            &filename,
            &self.download_path,
            self.max_pixels,
        )
        .await
    }

    async fn flip(&self, attachment: &AttachmentRef, reply: &dyn ChatReply) -> Result<()> {
        let filename = images::attachment_filename(&attachment.filename, &attachment.url);
        let image = images::download(&self.http, &attachment.url).await?;
        let ceiling = self.upload_ceiling;
        let packet = tokio::task::spawn_blocking(move || {
            packager::package(&image.rotate180(), &filename, ceiling)
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))??;
        upload(reply, "", vec![packet]).await;
        Ok(())
    }

    async fn generate(&self, request: GenerationRequest, reply: &dyn ChatReply) -> Result<()> {
        let ahead = self.gateway.waiting();
        let echoed = clip_prompt(&request.prompt);
        let status = if ahead == 0 {
            format!("“{echoed}”\n> Generating...")
        } else {
            format!("“{echoed}”\n> Queued behind {ahead} request(s)...")
        };
        say(reply, &status).await;

        let prompt = request.prompt.clone();
        let requester = request.requester.clone();
        let result = self.gateway.generate(request).await?;

        let (packets, notes) = self.package_results(&result, &prompt, &requester).await?;
        let mut text = summary(&prompt, &result);
        for note in notes {
            text.push('\n');
            text.push_str(&note);
        }
        upload(reply, &text, packets).await;
        Ok(())
    }

    /// Packs every image; ones that cannot fit are kept on disk and noted.
    async fn package_results(
        &self,
        result: &GenerationResult,
        prompt: &str,
        requester: &str,
    ) -> Result<(Vec<UploadPacket>, Vec<String>)> {
        let now = Local::now();
        let jobs: Vec<_> = result
            .images
            .iter()
            .map(|generated| {
                (
                    generated.image.clone(),
                    generated.seed,
                    images::output_filename(prompt, generated.seed, requester, now),
                )
            })
            .collect();
        let ceiling = self.upload_ceiling;
        let output_dir = self.output_dir.clone();
        let keep_dir = self.download_path.clone();

        let outcomes = tokio::task::spawn_blocking(move || {
            jobs.into_iter()
                .map(|(image, seed, filename)| {
                    let saved = output_dir.as_ref().and_then(|dir| {
                        images::save_png(&image, dir, &filename)
                            .inspect_err(|e| warn!("could not save {}: {}", filename, e))
                            .ok()
                    });
                    let packed = match saved {
                        // already on disk, no need to keep another copy
                        Some(_) => packager::package(&image, &filename, ceiling),
                        None => packager::package_or_keep(&image, &filename, ceiling, &keep_dir),
                    };
                    (seed, saved, packed)
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;

        let mut packets = Vec::new();
        let mut notes = Vec::new();
        for (seed, saved, packed) in outcomes {
            match packed {
                Ok(packet) => packets.push(packet),
                Err(Error::TooLarge { size, ceiling, saved_to }) => {
                    let kept = saved_to
                        .or(saved)
                        .map(|p| format!(", kept at `{}`", p.display()))
                        .unwrap_or_default();
                    notes.push(format!(
                        "seed {seed}: {size} bytes is over the {ceiling} byte upload limit{kept}"
                    ));
                }
                Err(e) => return Err(e),
            }
        }
        Ok((packets, notes))
    }
}

fn summary(prompt: &str, result: &GenerationResult) -> String {
    let seeds = result
        .seeds()
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join("|");
    let plural = if result.images.len() == 1 { "" } else { "s" };
    format!(
        "“{}”\nseed{}: {}, duration: {:.1}s",
        clip_prompt(prompt),
        plural,
        seeds,
        result.elapsed.as_secs_f64()
    )
}

fn clip_prompt(prompt: &str) -> String {
    match prompt.char_indices().nth(PROMPT_ECHO_CHARS) {
        Some((end, _)) => format!("{}…", &prompt[..end]),
        None => prompt.to_string(),
    }
}

// Progress messages are best effort; a failed send is logged, not fatal.
async fn say(reply: &dyn ChatReply, text: &str) {
    if let Err(e) = reply.say(text).await {
        warn!("failed to send message: {:#}", e);
    }
}

/// Sends the results. If the platform refuses them the user still hears why.
async fn upload(reply: &dyn ChatReply, text: &str, files: Vec<UploadPacket>) {
    let count = files.len();
    if let Err(e) = reply.upload(text, files).await {
        warn!("failed to send {} attachment(s): {:#}", count, e);
        say(reply, &format!("Error: could not send the results: {e}")).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_summary_format() {
        let result = GenerationResult {
            images: vec![
                crate::GeneratedImage {
                    image: DynamicImage::new_rgb8(1, 1),
                    seed: 42,
                },
                crate::GeneratedImage {
                    image: DynamicImage::new_rgb8(1, 1),
                    seed: 43,
                },
            ],
            elapsed: Duration::from_millis(12_340),
        };
        assert_eq!(summary("x", &result), "“x”\nseeds: 42|43, duration: 12.3s");
    }

    #[test]
    fn test_long_prompts_are_clipped() {
        assert_eq!(clip_prompt("short"), "short");
        let long = "é".repeat(PROMPT_ECHO_CHARS + 50);
        let clipped = clip_prompt(&long);
        assert_eq!(clipped.chars().count(), PROMPT_ECHO_CHARS + 1);
        assert!(clipped.ends_with('…'));
    }
}
