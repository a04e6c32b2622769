use std::sync::Arc;

use async_trait::async_trait;
use dreambot_core::{ChatReply, DreamBot, Invocation, UploadPacket};
use serenity::builder::{CreateAttachment, CreateMessage};
use serenity::model::channel::Message;
use serenity::model::gateway::Ready;
use serenity::model::id::ChannelId;
use serenity::prelude::*;
use tracing::{error, info};

/// Discord event handler. Serenity runs each event on its own task, so a
/// long generation never holds up other commands.
pub struct Handler {
    bot: Arc<DreamBot>,
}

impl Handler {
    pub fn new(bot: Arc<DreamBot>) -> Self {
        Self { bot }
    }
}

/// Replies into the channel the command came from.
struct ChannelReply {
    ctx: Context,
    channel_id: ChannelId,
}

#[async_trait]
impl ChatReply for ChannelReply {
    async fn say(&self, text: &str) -> anyhow::Result<()> {
        self.channel_id.say(&self.ctx, text).await?;
        Ok(())
    }

    async fn upload(&self, text: &str, files: Vec<UploadPacket>) -> anyhow::Result<()> {
        let attachments = files
            .into_iter()
            .map(|packet| CreateAttachment::bytes(packet.bytes, packet.filename));
        let mut message = CreateMessage::new().add_files(attachments);
        if !text.is_empty() {
            message = message.content(text);
        }
        self.channel_id.send_message(&self.ctx, message).await?;
        Ok(())
    }
}

fn invocation(msg: &Message) -> Invocation {
    msg.attachments.iter().fold(
        Invocation::new(msg.author.name.clone(), msg.content.clone()),
        |invocation, attachment| {
            invocation.with_attachment(attachment.url.clone(), attachment.filename.clone())
        },
    )
}

#[serenity::async_trait]
impl EventHandler for Handler {
    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }

        let reply = ChannelReply {
            ctx,
            channel_id: msg.channel_id,
        };
        if let Err(e) = self.bot.handle(&invocation(&msg), &reply).await {
            error!("Failed to reply in channel {}: {:#}", msg.channel_id, e);
        }
    }

    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!(
            "Logged in as {} ({}), model {}, prefix {}",
            ready.user.name,
            ready.user.id,
            self.bot.gateway().model_name(),
            self.bot.router().prefix()
        );
    }
}
