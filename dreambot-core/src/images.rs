//! Image I/O helpers: downloading attachments, naming files, resizing.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Local};
use image::imageops::FilterType;
use image::DynamicImage;
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{Error, Result};

const MAX_PROMPT_CHARS_IN_FILENAME: usize = 80;

fn placeholder_name() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^unknown\.\w+$").expect("valid regex"))
}

fn unsafe_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"[/\\:*?"<>|\x00-\x1f]+"#).expect("valid regex"))
}

fn short_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    hex::encode(&digest[..6])
}

/// Picks a usable name for an attachment. Pasted images arrive as
/// `unknown.png`; those get a stable name derived from their URL.
pub fn attachment_filename(filename: &str, url: &str) -> String {
    let filename = sanitize(filename);
    if !filename.is_empty() && !placeholder_name().is_match(&filename) {
        return filename;
    }
    let extension = Path::new(&filename)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("png");
    format!("img_{}.{}", short_hash(url), extension)
}

/// Replaces characters that are not allowed in file names.
pub fn sanitize(text: &str) -> String {
    unsafe_chars().replace_all(text.trim(), "_").into_owned()
}

/// `[YYYYmmdd-HHMMSS]_<prompt>_<seed>_(<requester>).png`
pub fn output_filename(prompt: &str, seed: u64, requester: &str, at: DateTime<Local>) -> String {
    let prompt: String = sanitize(prompt)
        .chars()
        .take(MAX_PROMPT_CHARS_IN_FILENAME)
        .collect();
    format!(
        "[{}]_{}_{}_({}).png",
        at.format("%Y%m%d-%H%M%S"),
        prompt,
        seed,
        sanitize(requester)
    )
}

/// Scales `image` so its area is at most `max_pixels`, keeping the aspect ratio.
pub fn fit_to_pixels(image: DynamicImage, max_pixels: u64) -> DynamicImage {
    let (width, height) = (image.width(), image.height());
    let pixels = u64::from(width) * u64::from(height);
    if pixels <= max_pixels || pixels == 0 {
        return image;
    }
    let scale = (max_pixels as f64 / pixels as f64).sqrt();
    let new_width = ((f64::from(width) * scale).floor() as u32).max(1);
    let new_height = ((f64::from(height) * scale).floor() as u32).max(1);
    debug!(
        "resizing {}x{} to {}x{} to fit {} pixels",
        width, height, new_width, new_height, max_pixels
    );
    image.resize_exact(new_width, new_height, FilterType::Lanczos3)
}

pub fn save_png(image: &DynamicImage, dir: &Path, filename: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(filename);
    image.save_with_format(&path, image::ImageFormat::Png)?;
    Ok(path)
}

/// Fetches and decodes an image. Any failure is the requester's problem.
pub async fn download(client: &reqwest::Client, url: &str) -> Result<DynamicImage> {
    debug!("downloading image from {}", url);
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| Error::validation(format!("could not fetch image: {e}")))?;
    if !response.status().is_success() {
        return Err(Error::validation(format!(
            "could not fetch image: HTTP {}",
            response.status()
        )));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| Error::validation(format!("could not read image: {e}")))?;
    image::load_from_memory(&bytes)
        .map_err(|e| Error::validation(format!("attachment is not a readable image: {e}")))
}

/// Downloads an attachment, shrinks it to `max_pixels`, and keeps a PNG copy
/// under `download_dir`.
pub async fn save_from_url(
    client: &reqwest::Client,
    url: &str,
    filename: &str,
    download_dir: &Path,
    max_pixels: u64,
) -> Result<(DynamicImage, PathBuf)> {
    let image = fit_to_pixels(download(client, url).await?, max_pixels);
    let dir = download_dir.to_path_buf();
    let name = format!(
        "{}.png",
        Path::new(filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("download")
    );
    let (image, path) = tokio::task::spawn_blocking(move || {
        let path = save_png(&image, &dir, &name)?;
        Ok::<_, Error>((image, path))
    })
    .await
    .map_err(|e| Error::Io(std::io::Error::other(e)))??;
    Ok((image, path))
}
