//! Command router
//!
//! Maps `<prefix><command> <args>` chat messages to typed commands. Generation
//! arguments use the flags of the `dream` command line (`-n2 -W512 -S42 ...`)
//! and are parsed with clap.

use clap::Parser;
use tracing::debug;

use crate::{Error, GenerationRequest, Result};

pub const DEFAULT_STRENGTH: f64 = 0.75;

const SIZE_STEP: u64 = 64;

const COMMANDS: &[(&str, &str)] = &[
    (
        "txt2img",
        "`<prompt> [-n count] [-W width] [-H height] [-C cfg_scale] [-S seed] [-s steps]` generate images from a prompt",
    ),
    ("img2img", "`<prompt> [... -f strength]` with an image attached, re-draw that image"),
    ("img", "with an image attached, send it back upside down"),
    ("echo", "`[text]` echo text back"),
    ("help", "show this message"),
];

/// One line per command, using the configured prefix.
pub fn help(prefix: &str) -> String {
    COMMANDS
        .iter()
        .map(|(name, about)| format!("**{prefix}{name}** {about}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// An attachment on the triggering message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRef {
    pub url: String,
    pub filename: String,
}

/// A chat message addressed to the bot, platform details stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub author: String,
    pub content: String,
    pub attachments: Vec<AttachmentRef>,
}

impl Invocation {
    pub fn new(author: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            content: content.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachment(mut self, url: impl Into<String>, filename: impl Into<String>) -> Self {
        self.attachments.push(AttachmentRef {
            url: url.into(),
            filename: filename.into(),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Txt2Img(GenerationRequest),
    /// `request.source` is filled in once the attachment is downloaded.
    Img2Img {
        request: GenerationRequest,
        strength: f64,
        source: AttachmentRef,
    },
    Flip(AttachmentRef),
    Echo(String),
    Help,
}

#[derive(Parser, Debug)]
#[command(
    name = "txt2img",
    no_binary_name = true,
    disable_help_flag = true,
    disable_version_flag = true
)]
struct DreamArgs {
    /// Prompt words
    #[arg(num_args = 0..)]
    prompt: Vec<String>,

    #[arg(short = 'n', long = "iterations", default_value_t = 1, allow_negative_numbers = true)]
    count: i64,

    #[arg(short = 'W', long, default_value_t = 512, allow_negative_numbers = true)]
    width: i64,

    #[arg(short = 'H', long, default_value_t = 512, allow_negative_numbers = true)]
    height: i64,

    #[arg(short = 'C', long = "cfg-scale", default_value_t = 7.5)]
    cfg_scale: f64,

    #[arg(short = 'S', long)]
    seed: Option<u64>,

    #[arg(short = 's', long, default_value_t = 50)]
    steps: usize,

    #[arg(short = 'f', long)]
    strength: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Router {
    prefix: String,
    max_pixels: u64,
}

impl Router {
    pub fn new(prefix: impl Into<String>, max_pixels: u64) -> Self {
        Self {
            prefix: prefix.into(),
            max_pixels,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `None` when the message is not addressed to the bot.
    pub fn route(&self, invocation: &Invocation) -> Option<Result<Command>> {
        let body = invocation.content.trim_start().strip_prefix(&self.prefix)?;
        let (name, args) = match body.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (body, ""),
        };
        if name.is_empty() {
            return None;
        }
        debug!("{} invoked {:?} with {:?}", invocation.author, name, args);
        Some(self.parse(name, args, invocation))
    }

    fn parse(&self, name: &str, args: &str, invocation: &Invocation) -> Result<Command> {
        let attachment = invocation.attachments.first().cloned();
        match name.to_lowercase().as_str() {
            "txt2img" | "img2img" => {
                let (mut request, strength) = self.parse_generation(args)?;
                request.requester = invocation.author.clone();
                match (attachment, strength) {
                    (Some(source), strength) => {
                        let strength = strength.unwrap_or(DEFAULT_STRENGTH);
                        check_strength(strength)?;
                        Ok(Command::Img2Img {
                            request,
                            strength,
                            source,
                        })
                    }
                    (None, _) if name.eq_ignore_ascii_case("img2img") => {
                        Err(Error::validation("img2img needs an image attached"))
                    }
                    (None, Some(_)) => Err(Error::validation(
                        "strength only applies when an image is attached",
                    )),
                    (None, None) => Ok(Command::Txt2Img(request)),
                }
            }
            "img" => attachment
                .map(Command::Flip)
                .ok_or_else(|| Error::validation("attach an image to flip")),
            "echo" => Ok(Command::Echo(if args.is_empty() {
                "<blank>".to_string()
            } else {
                args.to_string()
            })),
            "help" => Ok(Command::Help),
            other => Err(Error::validation(format!(
                "unknown command `{other}`, try `{}help`",
                self.prefix
            ))),
        }
    }

    fn parse_generation(&self, args: &str) -> Result<(GenerationRequest, Option<f64>)> {
        let words = split_args(args)?;
        let parsed = DreamArgs::try_parse_from(words).map_err(|e| {
            let rendered = e.render().to_string();
            Error::validation(
                rendered
                    .lines()
                    .next()
                    .unwrap_or("could not parse arguments")
                    .trim_start_matches("error: ")
                    .to_string(),
            )
        })?;

        if !(1..=i64::from(GenerationRequest::MAX_COUNT)).contains(&parsed.count) {
            return Err(Error::validation(format!(
                "n must be between 1 and {} inclusive",
                GenerationRequest::MAX_COUNT
            )));
        }

        let mut request = GenerationRequest::new(parsed.prompt.join(" "));
        request.count = parsed.count as u32;
        request.width = round_to_size_step(parsed.width)?;
        request.height = round_to_size_step(parsed.height)?;
        request.guidance = parsed.cfg_scale;
        request.steps = parsed.steps;
        request.seed = Some(parsed.seed.unwrap_or_else(rand::random));
        request.validate(self.max_pixels)?;

        Ok((request, parsed.strength))
    }
}

fn check_strength(strength: f64) -> Result<()> {
    if strength > 0.0 && strength < 1.0 {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "strength must be strictly between 0 and 1, got {strength}"
        )))
    }
}

/// Absolute value rounded up to a multiple of 64; zero becomes 64.
fn round_to_size_step(value: i64) -> Result<u32> {
    let value = value.unsigned_abs().max(1);
    let rounded = value.div_ceil(SIZE_STEP) * SIZE_STEP;
    u32::try_from(rounded).map_err(|_| Error::validation(format!("{value} pixels is too large")))
}

/// Splits on whitespace, keeping double-quoted spans together.
fn split_args(args: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut pending = false;

    for c in args.chars() {
        match c {
            '"' | '“' | '”' => {
                in_quotes = !in_quotes;
                pending = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if pending {
                    words.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            c => {
                current.push(c);
                pending = true;
            }
        }
    }
    if in_quotes {
        return Err(Error::validation("unterminated quote in arguments"));
    }
    if pending {
        words.push(current);
    }
    Ok(words)
}
