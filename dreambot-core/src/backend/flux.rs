use anyhow::{Context, Error, Result};
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{Module, VarBuilder};
use candle_transformers::models::clip::text_model::{
    Activation, ClipTextConfig, ClipTextTransformer,
};
use candle_transformers::models::flux::autoencoder::{self, AutoEncoder};
use candle_transformers::models::flux::model::{self, Flux};
use candle_transformers::models::flux::sampling;
use candle_transformers::models::t5::{self, T5EncoderModel};
use hf_hub::api::tokio::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use image::imageops::FilterType;
use image::DynamicImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use super::{DeviceMap, FluxVariant};
use crate::{GenerationRequest, ImageModel};

const T5_MAX_TOKENS: usize = 256;
const LATENT_CHANNELS: usize = 16;

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            warn!("No GPU available, running on CPU; build with `--features cuda` or `--features metal` to use one");
            Ok(Device::Cpu)
        }
    }
}

/// Converts a tensor with shape (3, height, width) into an RGB image.
fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// The inverse: an RGB image resized to `width` x `height`, as a
/// (1, 3, height, width) tensor scaled to [-1, 1].
fn image_to_tensor(
    img: &DynamicImage,
    width: usize,
    height: usize,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let rgb = img
        .resize_exact(width as u32, height as u32, FilterType::Lanczos3)
        .to_rgb8()
        .into_raw();
    let tensor = Tensor::from_vec(rgb, (height, width, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)?
        .unsqueeze(0)?
        .to_dtype(dtype)?;
    Ok(tensor)
}

/// Gaussian latent noise with the layout of `sampling::get_noise`, drawn from
/// a seeded CPU generator so a seed means the same image on every device.
fn seeded_noise(seed: u64, height: usize, width: usize, device: &Device) -> Result<Tensor> {
    let height = height.div_ceil(16) * 2;
    let width = width.div_ceil(16) * 2;
    let len = LATENT_CHANNELS * height * width;

    let mut rng = StdRng::seed_from_u64(seed);
    let mut values = Vec::with_capacity(len);
    while values.len() < len {
        // Box-Muller
        let u1: f32 = rng.random_range(f32::EPSILON..1.0);
        let u2: f32 = rng.random();
        let radius = (-2.0 * u1.ln()).sqrt();
        let angle = 2.0 * std::f32::consts::PI * u2;
        values.push(radius * angle.cos());
        values.push(radius * angle.sin());
    }
    values.truncate(len);
    Ok(Tensor::from_vec(values, (1, LATENT_CHANNELS, height, width), device)?)
}

pub struct FluxModel {
    variant: FluxVariant,
    device: Device,
    dtype: DType,
    t5_model: T5EncoderModel,
    t5_tokenizer: Tokenizer,
    clip_model: ClipTextTransformer,
    clip_tokenizer: Tokenizer,
    autoencoder: AutoEncoder,
    flux_model: Flux,
}

impl FluxModel {
    fn t5_embedding(&mut self, prompt: &str) -> Result<Tensor> {
        let mut tokens = self
            .t5_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        tokens.resize(T5_MAX_TOKENS, 0);
        let input_ids = Tensor::new(&*tokens, &self.device)?.unsqueeze(0)?;
        Ok(self.t5_model.forward(&input_ids)?)
    }

    fn clip_embedding(&self, prompt: &str) -> Result<Tensor> {
        let tokens = self
            .clip_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let input_ids = Tensor::new(&*tokens, &self.device)?.unsqueeze(0)?;
        Ok(self.clip_model.forward(&input_ids)?)
    }
}

impl ImageModel for FluxModel {
    fn generate(&mut self, request: &GenerationRequest, seed: u64) -> Result<DynamicImage> {
        let width = request.width as usize;
        let height = request.height as usize;

        let noise = seeded_noise(seed, height, width, &self.device)?.to_dtype(self.dtype)?;
        let t5_emb = self.t5_embedding(&request.prompt)?;
        let clip_emb = self.clip_embedding(&request.prompt)?;

        let packed = sampling::State::new(&t5_emb, &clip_emb, &noise)?;
        let mut timesteps = match self.variant {
            FluxVariant::Schnell => sampling::get_schedule(request.steps, None),
            FluxVariant::Dev => {
                sampling::get_schedule(request.steps, Some((packed.img.dim(1)?, 0.5, 1.15)))
            }
        };

        // img2img: start part-way down the schedule from a noised encoding of the source
        let start = match &request.source {
            None => packed.img.clone(),
            Some(source) => {
                let skip = timesteps
                    .iter()
                    .position(|&t| t <= source.strength)
                    .unwrap_or(timesteps.len())
                    .min(timesteps.len().saturating_sub(2));
                timesteps.drain(..skip);
                let t = timesteps[0];
                debug!("img2img from t = {:.3} ({} steps skipped)", t, skip);

                let pixels = image_to_tensor(&source.image, width, height, &self.device, self.dtype)?;
                let latent = self.autoencoder.encode(&pixels)?;
                let noised = ((latent * (1.0 - t))? + (noise * t)?)?;
                sampling::State::new(&t5_emb, &clip_emb, &noised)?.img
            }
        };

        let latent = sampling::denoise(
            &self.flux_model,
            &start,
            &packed.img_ids,
            &packed.txt,
            &packed.txt_ids,
            &packed.vec,
            &timesteps,
            request.guidance,
        )?;
        let unpacked = sampling::unpack(&latent, height, width)?;
        debug!("Generated latent image");

        let decoded = self.autoencoder.decode(&unpacked)?;
        let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        tensor_to_image(&img.i(0)?)
    }

    fn name(&self) -> &str {
        match self.variant {
            FluxVariant::Schnell => "flux-schnell",
            FluxVariant::Dev => "flux-dev",
        }
    }
}

/// Downloads `file` from `repo` and memory-maps it as model weights.
async fn fetch_weights(
    repo: &ApiRepo,
    file: &str,
    what: &str,
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    let path = repo
        .get(file)
        .await
        .with_context(|| format!("failed to download {what} weights"))?;
    // SAFETY: the file lives in the hub cache and is not modified while mapped.
    unsafe { VarBuilder::from_mmaped_safetensors(&[path], dtype, device) }
        .with_context(|| format!("failed to map {what} weights"))
}

async fn fetch_tokenizer(repo: &ApiRepo, file: &str, what: &str) -> Result<Tokenizer> {
    let path = repo
        .get(file)
        .await
        .with_context(|| format!("failed to download {what} tokenizer"))?;
    Tokenizer::from_file(path)
        .map_err(Error::msg)
        .with_context(|| format!("failed to load {what} tokenizer"))
}

pub struct FluxLoader;

impl FluxLoader {
    pub async fn load(variant: FluxVariant, api: Api, device_map: DeviceMap) -> Result<FluxModel> {
        let device = select_best_device(device_map).context("failed to set up device")?;
        let dtype = device.bf16_default_to_f32();

        let (t5_model, t5_tokenizer) = Self::load_t5(&api, dtype, &device).await?;
        info!("Loaded T5 encoder");
        let (clip_model, clip_tokenizer) = Self::load_clip(&api, dtype, &device).await?;
        info!("Loaded CLIP encoder");

        let repo = api.repo(Repo::model(variant.repo().to_string()));
        let (autoencoder_config, flux_config) = match variant {
            FluxVariant::Schnell => (autoencoder::Config::schnell(), model::Config::schnell()),
            FluxVariant::Dev => (autoencoder::Config::dev(), model::Config::dev()),
        };
        let vb = fetch_weights(&repo, "ae.safetensors", "autoencoder", dtype, &device).await?;
        let autoencoder =
            AutoEncoder::new(&autoencoder_config, vb).context("failed to build autoencoder")?;
        let vb = fetch_weights(&repo, variant.weights_file(), "transformer", dtype, &device).await?;
        let flux_model = Flux::new(&flux_config, vb).context("failed to build transformer")?;
        info!("Loaded {} on {:?}", variant.repo(), device);

        Ok(FluxModel {
            variant,
            device,
            dtype,
            t5_model,
            t5_tokenizer,
            clip_model,
            clip_tokenizer,
            autoencoder,
            flux_model,
        })
    }

    async fn load_t5(api: &Api, dtype: DType, device: &Device) -> Result<(T5EncoderModel, Tokenizer)> {
        let repo = api.repo(Repo::with_revision(
            "google/t5-v1_1-xxl".to_string(),
            RepoType::Model,
            "refs/pr/2".to_string(),
        ));
        let vb = fetch_weights(&repo, "model.safetensors", "T5", dtype, device).await?;
        let config_file = repo.get("config.json").await.context("failed to download T5 config")?;
        let config: t5::Config = serde_json::from_str(&std::fs::read_to_string(config_file)?)
            .context("failed to parse T5 config")?;
        let model = T5EncoderModel::load(vb, &config).context("failed to build T5 encoder")?;

        let tokenizers = api.repo(Repo::model("lmz/mt5-tokenizers".to_string()));
        let tokenizer = fetch_tokenizer(&tokenizers, "t5-v1_1-xxl.tokenizer.json", "T5").await?;
        Ok((model, tokenizer))
    }

    async fn load_clip(
        api: &Api,
        dtype: DType,
        device: &Device,
    ) -> Result<(ClipTextTransformer, Tokenizer)> {
        let repo = api.repo(Repo::model("openai/clip-vit-large-patch14".to_string()));
        let vb = fetch_weights(&repo, "model.safetensors", "CLIP", dtype, device).await?;
        let config = ClipTextConfig {
            vocab_size: 49408,
            projection_dim: 768,
            activation: Activation::QuickGelu,
            intermediate_size: 3072,
            embed_dim: 768,
            max_position_embeddings: 77,
            pad_with: None,
            num_hidden_layers: 12,
            num_attention_heads: 12,
        };
        let model = ClipTextTransformer::new(vb.pp("text_model"), &config)
            .context("failed to build CLIP encoder")?;
        let tokenizer = fetch_tokenizer(&repo, "tokenizer.json", "CLIP").await?;
        Ok((model, tokenizer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_noise_is_reproducible() {
        let a = seeded_noise(42, 512, 512, &Device::Cpu).unwrap();
        let b = seeded_noise(42, 512, 512, &Device::Cpu).unwrap();
        let c = seeded_noise(43, 512, 512, &Device::Cpu).unwrap();
        assert_eq!(a.dims(), &[1, LATENT_CHANNELS, 64, 64]);

        let a = a.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = b.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let c = c.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mean = a.iter().sum::<f32>() / a.len() as f32;
        assert!(mean.abs() < 0.05);
    }

    #[test]
    fn test_image_tensor_conversions() {
        let img = DynamicImage::new_rgb8(20, 10);
        let tensor = image_to_tensor(&img, 32, 16, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(tensor.dims(), &[1, 3, 16, 32]);

        let pixels = Tensor::zeros((3, 16, 32), DType::U8, &Device::Cpu).unwrap();
        let back = tensor_to_image(&pixels).unwrap();
        assert_eq!((back.width(), back.height()), (32, 16));
    }
}
