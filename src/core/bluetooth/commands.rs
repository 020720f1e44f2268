//! Stimulator commands implementation
//! Turns the six logical operations into frames and hands them to the connection.

use async_trait::async_trait;
use log::{error, info};
use serde::{Deserialize, Serialize};

use crate::core::bluetooth::connection::ConnectionManager;
use crate::core::bluetooth::error::{DispatchError, SendError};
use crate::core::bluetooth::transport::RadioTransport;
use crate::core::packet::{
    ChannelMask, Command, CommandFrame, MAX_COUNTER, MAX_CURRENT_TENTHS, MAX_FREQUENCY, MAX_PHASE,
    Waveform, encode_frame,
};
use crate::utils::to_hex;

/// Ceiling applied to requested current unless configured otherwise
pub const DEFAULT_CURRENT_LIMIT_MA: f32 = 5.0;

/// Frame sender trait
#[async_trait]
pub trait FrameSender: Send + Sync {
    /// Send a frame to the stimulator
    async fn send_frame(&self, frame: &CommandFrame) -> Result<(), SendError>;
}

#[async_trait]
impl<T: RadioTransport> FrameSender for ConnectionManager<T> {
    async fn send_frame(&self, frame: &CommandFrame) -> Result<(), SendError> {
        self.send(frame).await
    }
}

/// Parameters carried by a CONFIGURE frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StimParams {
    pub phase: u32,
    pub current_ma: f32,
    /// Occupies the frequency field; usually left at 0 and set with SET_FREQUENCY
    #[serde(default)]
    pub frequency_hz: u32,
    #[serde(default)]
    pub waveform: Waveform,
}

/// Command dispatcher for the stimulator
pub struct CommandDispatcher<S: FrameSender> {
    sender: S,
    current_limit_ma: f32,
}

impl<S: FrameSender> CommandDispatcher<S> {
    pub fn new(sender: S) -> Self {
        Self {
            sender,
            current_limit_ma: DEFAULT_CURRENT_LIMIT_MA,
        }
    }

    pub fn with_current_limit(mut self, current_limit_ma: f32) -> Self {
        self.current_limit_ma = current_limit_ma;
        self
    }

    pub fn sender(&self) -> &S {
        &self.sender
    }

    pub async fn set_frequency(
        &self,
        channels: ChannelMask,
        frequency_hz: u32,
    ) -> Result<CommandFrame, DispatchError> {
        check_max("frequency", frequency_hz, MAX_FREQUENCY)?;
        self.dispatch(Command::SetFrequency, channels, 0, 0.0, frequency_hz, Waveform::Sine)
            .await
    }

    pub async fn configure(
        &self,
        channels: ChannelMask,
        params: StimParams,
    ) -> Result<CommandFrame, DispatchError> {
        check_max("phase", params.phase, MAX_PHASE)?;
        check_max("frequency", params.frequency_hz, MAX_FREQUENCY)?;
        self.check_current(params.current_ma)?;
        self.dispatch(
            Command::Configure,
            channels,
            params.phase,
            params.current_ma,
            params.frequency_hz,
            params.waveform,
        )
        .await
    }

    /// Ramp-up duration in firmware ticks
    pub async fn set_on_counter(
        &self,
        channels: ChannelMask,
        ticks: u32,
    ) -> Result<CommandFrame, DispatchError> {
        check_max("on counter", ticks, MAX_COUNTER)?;
        self.dispatch(Command::SetOnCounter, channels, 0, 0.0, ticks, Waveform::Sine)
            .await
    }

    /// Ramp-down duration in firmware ticks
    pub async fn set_off_counter(
        &self,
        channels: ChannelMask,
        ticks: u32,
    ) -> Result<CommandFrame, DispatchError> {
        check_max("off counter", ticks, MAX_COUNTER)?;
        self.dispatch(Command::SetOffCounter, channels, 0, 0.0, ticks, Waveform::Sine)
            .await
    }

    pub async fn enable(&self, channels: ChannelMask) -> Result<CommandFrame, DispatchError> {
        self.dispatch(Command::Enable, channels, 0, 0.0, 0, Waveform::Sine)
            .await
    }

    pub async fn disable(&self, channels: ChannelMask) -> Result<CommandFrame, DispatchError> {
        self.dispatch(Command::Disable, channels, 0, 0.0, 0, Waveform::Sine)
            .await
    }

    fn check_current(&self, current_ma: f32) -> Result<(), DispatchError> {
        if !current_ma.is_finite() || current_ma < 0.0 {
            return Err(invalid("current", format!("{} mA is not a valid current", current_ma)));
        }
        if current_ma > self.current_limit_ma {
            return Err(invalid(
                "current",
                format!("{} mA exceeds the {} mA limit", current_ma, self.current_limit_ma),
            ));
        }
        if (current_ma as f64 * 10.0).round() > MAX_CURRENT_TENTHS as f64 {
            return Err(invalid("current", format!("{} mA does not fit in 21 bits", current_ma)));
        }
        Ok(())
    }

    /// Encodes, self-checks and sends once. A failed send is reported, never retried.
    async fn dispatch(
        &self,
        command: Command,
        channels: ChannelMask,
        phase: u32,
        current_ma: f32,
        frequency_hz: u32,
        waveform: Waveform,
    ) -> Result<CommandFrame, DispatchError> {
        if channels.is_empty() {
            return Err(invalid("channels", "no channel selected".to_string()));
        }

        let frame = encode_frame(command, channels.bits(), phase, current_ma, frequency_hz, waveform);
        let bytes = frame.to_bytes();
        CommandFrame::parse(&bytes)?;

        match self.sender.send_frame(&frame).await {
            Ok(()) => {
                info!("TX {:?} ch={:?}: [{}]", command, channels.channels(), to_hex(&bytes));
                Ok(frame)
            }
            Err(e) => {
                error!("Failed to send {:?} to ch={:?}: {}", command, channels.channels(), e);
                Err(e.into())
            }
        }
    }
}

fn check_max(field: &'static str, value: u32, max: u32) -> Result<(), DispatchError> {
    if value > max {
        return Err(invalid(field, format!("{} exceeds maximum {}", value, max)));
    }
    Ok(())
}

fn invalid(field: &'static str, reason: String) -> DispatchError {
    DispatchError::InvalidArgument { field, reason }
}
