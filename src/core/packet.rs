//! Stimulator command packet encoding
//! This module packs stimulation parameters into the fixed 12-byte frame understood by the firmware.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// First byte of every frame
pub const START_BYTE: u8 = 0xAA;
/// Last byte of every frame
pub const END_BYTE: u8 = 0x55;
/// Payload length in bytes (one packed u64)
pub const PAYLOAD_LEN: usize = 8;
/// Total frame length: start + header + payload + checksum + end
pub const FRAME_LEN: usize = PAYLOAD_LEN + 4;

pub const PHASE_BITS: u32 = 21;
pub const WAVEFORM_BITS: u32 = 2;
pub const FREQUENCY_BITS: u32 = 20;
pub const CURRENT_BITS: u32 = 21;

const PHASE_SHIFT: u32 = 43;
const WAVEFORM_SHIFT: u32 = 41;
const FREQUENCY_SHIFT: u32 = 21;

pub const PHASE_MASK: u64 = (1 << PHASE_BITS) - 1;
pub const WAVEFORM_MASK: u64 = (1 << WAVEFORM_BITS) - 1;
pub const FREQUENCY_MASK: u64 = (1 << FREQUENCY_BITS) - 1;
pub const CURRENT_MASK: u64 = (1 << CURRENT_BITS) - 1;

/// Largest value each field can carry without wrapping
pub const MAX_PHASE: u32 = PHASE_MASK as u32;
pub const MAX_FREQUENCY: u32 = FREQUENCY_MASK as u32;
pub const MAX_COUNTER: u32 = FREQUENCY_MASK as u32;
pub const MAX_CURRENT_TENTHS: u32 = CURRENT_MASK as u32;

/// Stimulator commands (upper nibble of the header)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Command {
    /// Set stimulation frequency (0x0)
    SetFrequency = 0x0,
    /// Set phase, waveform and current (0x1)
    Configure = 0x1,
    /// Set ramp-up counter (0x2)
    SetOnCounter = 0x2,
    /// Set ramp-down counter (0x3)
    SetOffCounter = 0x3,
    /// Start stimulation on the selected channels (0x4)
    Enable = 0x4,
    /// Stop stimulation on the selected channels (0x5)
    Disable = 0x5,
}

impl Command {
    /// The 4-bit command code
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0x0 => Some(Self::SetFrequency),
            0x1 => Some(Self::Configure),
            0x2 => Some(Self::SetOnCounter),
            0x3 => Some(Self::SetOffCounter),
            0x4 => Some(Self::Enable),
            0x5 => Some(Self::Disable),
            _ => None,
        }
    }
}

/// Output waveform selector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Waveform {
    #[default]
    Sine = 0,
    Triangle = 1,
    Sawtooth = 2,
}

impl Waveform {
    pub const fn bits(self) -> u8 {
        self as u8
    }

    /// Returns `None` for the reserved selector value 3
    pub const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Sine),
            1 => Some(Self::Triangle),
            2 => Some(Self::Sawtooth),
            _ => None,
        }
    }
}

impl std::str::FromStr for Waveform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sine" => Ok(Self::Sine),
            "triangle" => Ok(Self::Triangle),
            "sawtooth" => Ok(Self::Sawtooth),
            other => Err(format!("unknown waveform '{}'", other)),
        }
    }
}

/// Bitmask of the (up to four) output channels a command addresses.
/// Bit 0 is channel 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelMask(u8);

impl ChannelMask {
    pub const ALL: ChannelMask = ChannelMask(0x0F);

    /// Keeps only the low nibble
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & 0x0F)
    }

    /// Builds a mask from 1-based channel numbers
    pub fn from_channels(channels: &[u8]) -> Result<Self, FrameError> {
        let mut bits = 0u8;
        for &channel in channels {
            if !(1..=4).contains(&channel) {
                return Err(FrameError::InvalidChannel(channel));
            }
            bits |= 1 << (channel - 1);
        }
        Ok(Self(bits))
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// 1-based channel numbers selected by this mask
    pub fn channels(self) -> Vec<u8> {
        (1..=4).filter(|c| self.0 & (1 << (c - 1)) != 0).collect()
    }
}

/// Errors raised when parsing frames or building masks
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame must be 12 bytes, got {0}")]
    InvalidLength(usize),

    #[error("Bad frame marker at offset {offset}: {value:#04x}")]
    BadMarker { offset: usize, value: u8 },

    #[error("Checksum mismatch: expected {expected:#04x}, found {found:#04x}")]
    ChecksumMismatch { expected: u8, found: u8 },

    #[error("Unknown command code {0:#x}")]
    UnknownCommand(u8),

    #[error("Channel {0} is out of range (1-4)")]
    InvalidChannel(u8),
}

/// The individual fields of the 64-bit payload, already reduced to their bit widths
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PayloadFields {
    pub phase: u32,
    pub waveform: u8,
    pub frequency: u32,
    /// Current in 0.1 mA units
    pub current_tenths: u32,
}

impl PayloadFields {
    /// Packs the fields, masking each one to its width
    pub fn pack(&self) -> u64 {
        ((self.phase as u64 & PHASE_MASK) << PHASE_SHIFT)
            | ((self.waveform as u64 & WAVEFORM_MASK) << WAVEFORM_SHIFT)
            | ((self.frequency as u64 & FREQUENCY_MASK) << FREQUENCY_SHIFT)
            | (self.current_tenths as u64 & CURRENT_MASK)
    }

    pub fn unpack(packed: u64) -> Self {
        Self {
            phase: ((packed >> PHASE_SHIFT) & PHASE_MASK) as u32,
            waveform: ((packed >> WAVEFORM_SHIFT) & WAVEFORM_MASK) as u8,
            frequency: ((packed >> FREQUENCY_SHIFT) & FREQUENCY_MASK) as u32,
            current_tenths: (packed & CURRENT_MASK) as u32,
        }
    }
}

/// Converts milliamps to the 0.1 mA fixed-point value carried on the wire.
/// Negative and non-finite inputs wrap through the 21-bit mask like every other field.
pub fn current_to_tenths(current_ma: f32) -> u32 {
    let tenths = (current_ma as f64 * 10.0).round() as i64;
    (tenths as u64 & CURRENT_MASK) as u32
}

/// A complete, immutable command frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame {
    header: u8,
    payload: [u8; PAYLOAD_LEN],
    checksum: u8,
}

impl CommandFrame {
    fn new(header: u8, payload: [u8; PAYLOAD_LEN]) -> Self {
        Self {
            header,
            payload,
            checksum: checksum(header, &payload),
        }
    }

    pub fn header(&self) -> u8 {
        self.header
    }

    pub fn payload(&self) -> &[u8; PAYLOAD_LEN] {
        &self.payload
    }

    pub fn checksum(&self) -> u8 {
        self.checksum
    }

    /// Returns `None` if the header nibble is not a known command
    pub fn command(&self) -> Option<Command> {
        Command::from_code(self.header >> 4)
    }

    pub fn channel_mask(&self) -> ChannelMask {
        ChannelMask::from_bits_truncate(self.header)
    }

    pub fn fields(&self) -> PayloadFields {
        PayloadFields::unpack(u64::from_be_bytes(self.payload))
    }

    /// Serializes the frame with its start and end markers
    pub fn to_bytes(&self) -> [u8; FRAME_LEN] {
        let mut out = [0u8; FRAME_LEN];
        out[0] = START_BYTE;
        out[1] = self.header;
        out[2..2 + PAYLOAD_LEN].copy_from_slice(&self.payload);
        out[FRAME_LEN - 2] = self.checksum;
        out[FRAME_LEN - 1] = END_BYTE;
        out
    }

    /// Parses and validates a received or assembled frame
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() != FRAME_LEN {
            return Err(FrameError::InvalidLength(bytes.len()));
        }
        if bytes[0] != START_BYTE {
            return Err(FrameError::BadMarker { offset: 0, value: bytes[0] });
        }
        if bytes[FRAME_LEN - 1] != END_BYTE {
            return Err(FrameError::BadMarker {
                offset: FRAME_LEN - 1,
                value: bytes[FRAME_LEN - 1],
            });
        }

        let header = bytes[1];
        let mut payload = [0u8; PAYLOAD_LEN];
        payload.copy_from_slice(&bytes[2..2 + PAYLOAD_LEN]);

        let expected = checksum(header, &payload);
        let found = bytes[FRAME_LEN - 2];
        if expected != found {
            return Err(FrameError::ChecksumMismatch { expected, found });
        }
        if Command::from_code(header >> 4).is_none() {
            return Err(FrameError::UnknownCommand(header >> 4));
        }

        Ok(Self { header, payload, checksum: found })
    }
}

/// `(header + sum(payload)) mod 256`
pub fn checksum(header: u8, payload: &[u8]) -> u8 {
    payload
        .iter()
        .fold(header, |acc, byte| acc.wrapping_add(*byte))
}

/// Recomputes the checksum of a serialized frame and compares it with the one it carries.
/// Frames of the wrong length never verify.
pub fn verify_checksum(frame: &[u8]) -> bool {
    if frame.len() != FRAME_LEN {
        return false;
    }
    checksum(frame[1], &frame[2..2 + PAYLOAD_LEN]) == frame[FRAME_LEN - 2]
}

/// Builds a frame. Never fails: every numeric field is masked to its bit width,
/// so out-of-range values wrap rather than being rejected.
pub fn encode_frame(
    command: Command,
    channel_mask: u8,
    phase: u32,
    current_ma: f32,
    freq_hz: u32,
    waveform: Waveform,
) -> CommandFrame {
    let fields = PayloadFields {
        phase,
        waveform: waveform.bits(),
        frequency: freq_hz,
        current_tenths: current_to_tenths(current_ma),
    };
    let header = (command.code() << 4) | (channel_mask & 0x0F);
    CommandFrame::new(header, fields.pack().to_be_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn configure_frame_matches_firmware_layout() {
        let frame = encode_frame(Command::Configure, 0b0011, 30, 2.0, 0, Waveform::Triangle);
        let bytes = frame.to_bytes();

        assert_eq!(bytes.len(), 12);
        assert_eq!(bytes[0], 0xAA);
        assert_eq!(bytes[1], 0x13);
        assert_eq!(bytes[11], 0x55);

        let packed = u64::from_be_bytes(bytes[2..10].try_into().unwrap());
        assert_eq!(packed >> 43, 30);
        assert_eq!((packed >> 41) & 0b11, 1);
        assert_eq!((packed >> 21) & FREQUENCY_MASK, 0);
        assert_eq!(packed & CURRENT_MASK, 20);

        let sum = bytes[2..10].iter().fold(0x13u32, |acc, b| acc + *b as u32);
        assert_eq!(bytes[10], (sum & 0xFF) as u8);
        assert!(verify_checksum(&bytes));
    }

    #[test]
    fn enable_and_disable_carry_empty_payload() {
        for command in [Command::Enable, Command::Disable] {
            let frame = encode_frame(command, 0x0F, 0, 0.0, 0, Waveform::Sine);
            assert_eq!(frame.payload(), &[0u8; 8]);
            assert_eq!(frame.checksum(), frame.header());
        }
    }

    #[test]
    fn oversized_fields_wrap_instead_of_clamping() {
        let frame = encode_frame(Command::Configure, 0xF1, MAX_PHASE + 5, 0.0, MAX_FREQUENCY + 2, Waveform::Sine);
        let fields = frame.fields();
        assert_eq!(fields.phase, 4);
        assert_eq!(fields.frequency, 1);
        // Channel bits above the low nibble are dropped
        assert_eq!(frame.header(), 0x11);
    }

    #[test]
    fn current_is_rounded_to_tenths() {
        assert_eq!(current_to_tenths(2.5), 25);
        assert_eq!(current_to_tenths(0.04), 0);
        assert_eq!(current_to_tenths(0.06), 1);
        assert_eq!(current_to_tenths(f32::NAN), 0);
    }

    #[test]
    fn parse_rejects_bad_markers_and_checksum() {
        let bytes = encode_frame(Command::SetFrequency, 1, 0, 0.0, 1000, Waveform::Sine).to_bytes();
        assert!(CommandFrame::parse(&bytes).is_ok());

        let mut bad_start = bytes;
        bad_start[0] = 0x00;
        assert_eq!(
            CommandFrame::parse(&bad_start),
            Err(FrameError::BadMarker { offset: 0, value: 0x00 })
        );

        let mut bad_sum = bytes;
        bad_sum[10] = bad_sum[10].wrapping_add(1);
        assert!(matches!(
            CommandFrame::parse(&bad_sum),
            Err(FrameError::ChecksumMismatch { .. })
        ));

        assert_eq!(CommandFrame::parse(&bytes[..11]), Err(FrameError::InvalidLength(11)));
    }

    #[test]
    fn channel_mask_from_channels() {
        assert_eq!(ChannelMask::from_channels(&[1, 2]).unwrap().bits(), 0b0011);
        assert_eq!(ChannelMask::from_channels(&[4]).unwrap().channels(), vec![4]);
        assert_eq!(ChannelMask::from_channels(&[5]), Err(FrameError::InvalidChannel(5)));
    }

    proptest! {
        #[test]
        fn packed_fields_round_trip(
            phase in 0..=MAX_PHASE,
            waveform in 0u8..=2,
            frequency in 0..=MAX_FREQUENCY,
            current in 0..=MAX_CURRENT_TENTHS,
        ) {
            let fields = PayloadFields { phase, waveform, frequency, current_tenths: current };
            prop_assert_eq!(PayloadFields::unpack(fields.pack()), fields);
        }

        #[test]
        fn encoded_frames_always_verify(
            code in 0u8..=5,
            mask in any::<u8>(),
            phase in any::<u32>(),
            current in -1000.0f32..1000.0,
            freq in any::<u32>(),
        ) {
            let command = Command::from_code(code).unwrap();
            let bytes = encode_frame(command, mask, phase, current, freq, Waveform::Sawtooth).to_bytes();
            prop_assert!(verify_checksum(&bytes));
        }

        #[test]
        fn single_byte_corruption_is_detected(
            phase in 0..=MAX_PHASE,
            freq in 0..=MAX_FREQUENCY,
            index in 1usize..10,
            delta in 1u8..=255,
        ) {
            let mut bytes = encode_frame(Command::Configure, 0x5, phase, 1.5, freq, Waveform::Sine).to_bytes();
            bytes[index] = bytes[index].wrapping_add(delta);
            prop_assert!(!verify_checksum(&bytes));
        }
    }
}
