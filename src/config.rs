use std::time::Duration;
use anyhow::bail;
use crate::frame::MAX_PAYLOAD_LEN;

pub struct LinkConfig {
    /// This is the modulus of the sequence number space. At most `window_size - 1` frames are
    ///  unacknowledged at any given time.
    ///
    /// NB: This is relevant for the connecting side only - the accepting side learns the window
    ///  size from the first frame it receives.
    pub window_size: u32,

    /// The size of the chunks an [crate::stream::ArqStream] splits written data into, i.e. the
    ///  maximum payload per DATA frame.
    pub packet_size: usize,

    /// The time after which the oldest unacknowledged frame is considered lost, triggering
    ///  retransmission of all unacknowledged frames.
    ///
    /// This must be significantly longer than the round trip time *plus* the channel's pacing
    ///  delay for every frame in the window, otherwise frames are retransmitted needlessly.
    pub data_timeout: Duration,

    /// When a frame arrives, an ack is sent after this delay unless it can be piggybacked on a
    ///  data frame that is sent in the meantime.
    pub ack_delay: Duration,

    /// Number of consecutive data timeouts without any acknowledged progress after which the
    ///  connection is considered dead. `None` retransmits forever.
    pub max_retransmissions: Option<u32>,

    /// The side that received end-of-stream keeps acknowledging retransmitted EOS frames for
    ///  this long after closing, in case its ack for the peer's EOS got lost.
    pub linger: Duration,

    pub channel: ChannelConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        let data_timeout = Duration::from_millis(500);
        LinkConfig {
            window_size: 8,
            packet_size: 1024,
            data_timeout,
            ack_delay: Duration::from_millis(50),
            max_retransmissions: None,
            linger: 2 * data_timeout,
            channel: ChannelConfig::default(),
        }
    }
}

impl LinkConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.window_size < 2 {
            bail!("window size must be at least 2, was {}", self.window_size);
        }
        if self.packet_size == 0 || self.packet_size > MAX_PAYLOAD_LEN {
            bail!("packet size must be between 1 and {}, was {}", MAX_PAYLOAD_LEN, self.packet_size);
        }
        if self.data_timeout.is_zero() {
            bail!("data timeout must not be zero");
        }
        if self.data_timeout <= 2 * self.channel.pacing_delay {
            bail!("data timeout {:?} is too short for a pacing delay of {:?}", self.data_timeout, self.channel.pacing_delay);
        }
        if self.ack_delay.is_zero() {
            bail!("ack delay must not be zero");
        }
        self.channel.validate()
    }
}

/// Impairments and pacing applied to every outgoing frame. Everything is off by default.
#[derive(Clone, Debug, Default)]
pub struct ChannelConfig {
    /// percentage of frames that are silently discarded
    pub drop_percent: u8,
    /// percentage of frames that get a single random bit flipped
    pub damage_percent: u8,
    /// percentage of frames that are sent from a detached task after an extra delay of up to
    ///  twice the pacing delay, allowing them to overtake or be overtaken by other frames
    pub delay_percent: u8,
    /// fixed delay before every send
    pub pacing_delay: Duration,
    /// seeds the impairment decisions for reproducible runs
    pub seed: Option<u64>,
}

impl ChannelConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, percent) in [("drop", self.drop_percent), ("damage", self.damage_percent), ("delay", self.delay_percent)] {
            if percent > 100 {
                bail!("{} percentage must be at most 100, was {}", name, percent);
            }
        }
        Ok(())
    }

    pub fn max_extra_delay(&self) -> Duration {
        2 * self.pacing_delay
    }
}
