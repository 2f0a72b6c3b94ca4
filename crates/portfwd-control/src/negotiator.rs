//! Channel-open negotiation for `forward` channels, in both directions

use tracing::{debug, info, warn};

use portfwd_proto::{
    decode_channel_open, encode_channel_open, ChannelId, ChannelOpenAttempt, ChannelOpenMessage,
    ChannelOpenReply, FailureReason, FORWARD_CHANNEL_TYPE,
};

use crate::error::ChannelOpenError;
use crate::handler::ForwardingService;
use crate::session::ChannelOrigin;
use crate::tracker::ForwardKey;

impl ForwardingService {
    /// Decode and negotiate a channel-open message from the session
    pub async fn handle_channel_open_message(
        &mut self,
        channel: ChannelId,
        message: &ChannelOpenMessage,
        origin: ChannelOrigin,
    ) -> ChannelOpenReply {
        // Foreign channel types carry foreign payloads; reject before decoding
        if message.channel_type != FORWARD_CHANNEL_TYPE {
            return unknown_channel_type(channel, &message.channel_type);
        }

        match decode_channel_open(message, origin.is_remote()) {
            Ok(attempt) => self.negotiate(channel, &attempt).await,
            Err(e) => {
                warn!(channel, "Malformed forward channel open: {}", e);
                ChannelOpenReply::failure(
                    FailureReason::ConnectFailed,
                    format!("Malformed forward channel request: {}", e),
                )
            }
        }
    }

    /// Decide whether a decoded channel-open attempt may proceed
    ///
    /// On acceptance the channel is attached to its grant before this
    /// returns.
    pub async fn negotiate(
        &mut self,
        channel: ChannelId,
        attempt: &ChannelOpenAttempt,
    ) -> ChannelOpenReply {
        if attempt.channel_type != FORWARD_CHANNEL_TYPE {
            return unknown_channel_type(channel, &attempt.channel_type);
        }

        if attempt.origin_is_remote && !self.config.allow_remote_channels {
            warn!(channel, "Rejected remote-initiated forward channel");
            return ChannelOpenReply::failure(
                FailureReason::AdministrativelyProhibited,
                "Remote-initiated forward channels are disabled",
            );
        }

        let key = match self
            .tracker
            .lookup(&attempt.target_host, attempt.target_port)
        {
            Some(grant) => grant.key(),
            None => {
                warn!(
                    channel,
                    host = %attempt.target_host,
                    port = attempt.target_port,
                    "Rejected forward channel without a matching grant"
                );
                return ChannelOpenReply::failure(
                    FailureReason::AdministrativelyProhibited,
                    format!(
                        "No active forward for {}:{}",
                        attempt.target_host, attempt.target_port
                    ),
                );
            }
        };

        let verdict = self.session.check_channel_open(attempt).await;
        if !verdict.is_confirmation() {
            debug!(
                channel,
                reason = %verdict.reason(),
                "Session rejected forward channel"
            );
            return verdict;
        }

        self.tracker.attach_channel(&key, channel);
        info!(
            channel,
            forward = %key,
            remote = attempt.origin_is_remote,
            originator = ?attempt.originator_address,
            "Forward channel accepted"
        );

        verdict
    }

    /// Open a channel towards the peer
    ///
    /// A `forward` channel whose target matches a grant is attached to it, so
    /// cancelling the grant closes the channel too.
    pub async fn open_channel(
        &mut self,
        channel_type: &str,
        originator_address: Option<&str>,
        originator_port: Option<u16>,
        target_host: &str,
        target_port: u16,
    ) -> Result<ChannelId, ChannelOpenError> {
        let attempt = ChannelOpenAttempt {
            channel_type: channel_type.to_string(),
            origin_is_remote: false,
            originator_address: originator_address.map(str::to_string),
            originator_port,
            target_host: target_host.to_string(),
            target_port,
        };

        let message = encode_channel_open(&attempt).map_err(|e| {
            ChannelOpenError::new(
                FailureReason::ConnectFailed,
                format!("Failed to encode channel open: {}", e),
            )
        })?;

        match self.session.open_channel(message).await {
            Ok(channel) => {
                info!(
                    channel,
                    "Opened {} channel to {}:{}", channel_type, target_host, target_port
                );

                if channel_type == FORWARD_CHANNEL_TYPE {
                    let key = ForwardKey::new(target_host, target_port);
                    if self.tracker.attach_channel(&key, channel) {
                        debug!(channel, forward = %key, "Outbound channel attached to forward");
                    }
                }

                Ok(channel)
            }
            Err(e) => {
                warn!(
                    "Failed to open {} channel to {}:{}: {}",
                    channel_type, target_host, target_port, e
                );
                Err(e)
            }
        }
    }
}

fn unknown_channel_type(channel: ChannelId, channel_type: &str) -> ChannelOpenReply {
    debug!(channel, channel_type, "Unknown channel type");
    ChannelOpenReply::failure(
        FailureReason::UnknownChannelType,
        format!("Unknown channel type '{}'", channel_type),
    )
}
