use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::ops::RangeInclusive;
use std::str::FromStr;

use super::{ProtoError, Result};

/// Number of analog channels of the DSOX1204G.
pub const CHANNEL_COUNT: u8 = 4;

/// Reference waveform memories.
pub const WAVEFORM_MEMORY_COUNT: u8 = 2;

/// Labels longer than this are cut by the instrument.
pub const MAX_LABEL_LEN: usize = 10;

pub const PROBE_ATTENUATION: RangeInclusive<f64> = 0.1..=10000.0;
pub const RAMP_SYMMETRY: RangeInclusive<f64> = 0.0..=100.0;
pub const SQUARE_DUTY_CYCLE: RangeInclusive<f64> = 1.0..=99.0;

/// Declares a keyword parameter: the enum, its SCPI mnemonic and the name
/// used on the command line.
macro_rules! keyword {
    (
        $(#[$meta:meta])*
        $name:ident {
            $($(#[$vmeta:meta])* $variant:ident => $scpi:literal, $cli:literal;)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
        pub enum $name {
            $($(#[$vmeta])* $variant,)+
        }

        impl $name {
            pub fn mnemonic(&self) -> &'static str {
                match self {
                    $(Self::$variant => $scpi,)+
                }
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.mnemonic())
            }
        }

        impl clap::ValueEnum for $name {
            fn value_variants<'a>() -> &'a [Self] {
                &[$(Self::$variant,)+]
            }

            fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
                Some(match self {
                    $(Self::$variant => clap::builder::PossibleValue::new($cli),)+
                })
            }
        }
    };
}

keyword! {
    /// Input coupling of an analog channel
    Coupling {
        Ac => "AC", "ac";
        Dc => "DC", "dc";
    }
}

keyword! {
    /// Suffix for vertical values
    VoltUnit {
        Volt => "V", "V";
        Millivolt => "mV", "mV";
    }
}

keyword! {
    /// Measurement unit of the connected probe
    ProbeUnit {
        Volt => "VOLT", "volt";
        Ampere => "AMPere", "ampere";
    }
}

keyword! {
    /// Color palette of a screen image
    Palette {
        Color => "COLor", "color";
        Grayscale => "GRAYscale", "grayscale";
    }
}

keyword! {
    /// Automatic measurements. Each one is installed on screen before
    /// its value is queried.
    MeasurementKind {
        /// (+pulse width / period) * 100
        DutyCycle => "DUTYcycle", "duty-cycle";
        FallTime => "FALLtime", "fall-time";
        RiseTime => "RISetime", "rise-time";
        Frequency => "FREQuency", "frequency";
        Amplitude => "VAMPlitude", "amplitude";
        Average => "VAVerage", "average";
        Base => "VBASe", "base";
        Top => "VTOP", "top";
        Maximum => "VMAX", "max";
        Minimum => "VMIN", "min";
        PeakToPeak => "VPP", "peak-to-peak";
        Rms => "VRMS", "rms";
        /// Time of the maximum value
        XAtMaximum => "XMAX", "x-at-max";
        /// Time of the minimum value
        XAtMinimum => "XMIN", "x-at-min";
    }
}

keyword! {
    TriggerMode {
        Edge => "EDGE", "edge";
        Glitch => "GLITch", "glitch";
        Pattern => "PATTern", "pattern";
        SetupHold => "SHOLd", "setup-hold";
        Transition => "TRANsition", "transition";
        Tv => "TV", "tv";
        SerialBus => "SBUS1", "serial-bus";
    }
}

keyword! {
    /// Edge trigger slope. Not valid in TV trigger mode.
    Slope {
        Negative => "NEGative", "negative";
        Positive => "POSitive", "positive";
        Either => "EITHer", "either";
        Alternate => "ALTernate", "alternate";
    }
}

keyword! {
    /// Waveform generator signal type
    WaveFunction {
        Sinusoid => "SINusoid", "sinusoid";
        Square => "SQUare", "square";
        Ramp => "RAMP", "ramp";
        Pulse => "PULSe", "pulse";
        Noise => "NOISe", "noise";
        Dc => "DC", "dc";
    }
}

/// Analog input channel, 1 to 4.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel(u8);

impl Channel {
    pub fn new(n: u8) -> Result<Self> {
        if (1..=CHANNEL_COUNT).contains(&n) {
            Ok(Self(n))
        } else {
            Err(ProtoError::InvalidArgument(format!(
                "Channel must be in range 1 .. {}, got {}",
                CHANNEL_COUNT, n
            )))
        }
    }

    pub fn number(&self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Channel {
    type Error = ProtoError;

    fn try_from(n: u8) -> Result<Self> {
        Self::new(n)
    }
}

impl Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CHANnel{}", self.0)
    }
}

/// Source of an automatic measurement
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MeasurementSource {
    Channel(Channel),
    Function,
    Math,
    /// Reference waveform memory 1 or 2
    WaveformMemory(u8),
    External,
}

impl MeasurementSource {
    /// Only reference memories 1 and 2 exist.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::WaveformMemory(r) if !(1..=WAVEFORM_MEMORY_COUNT).contains(r) => {
                Err(ProtoError::InvalidArgument(format!(
                    "Waveform memory must be in range 1 .. {}, got {}",
                    WAVEFORM_MEMORY_COUNT, r
                )))
            }
            _ => Ok(()),
        }
    }
}

impl Display for MeasurementSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel(ch) => Display::fmt(ch, f),
            Self::Function => f.write_str("FUNCtion"),
            Self::Math => f.write_str("MATH"),
            Self::WaveformMemory(r) => write!(f, "WMEMory{}", r),
            Self::External => f.write_str("EXTernal"),
        }
    }
}

impl FromStr for MeasurementSource {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.to_lowercase();
        if let Some(ch) = parse_channel(&s)? {
            return Ok(Self::Channel(ch));
        }
        if let Some(r) = numbered(&s, &["wmemory", "wmem"]) {
            return match r.parse::<u8>() {
                Ok(r @ 1..=WAVEFORM_MEMORY_COUNT) => Ok(Self::WaveformMemory(r)),
                _ => Err(invalid_source(&s)),
            };
        }
        match s.as_str() {
            "function" | "func" => Ok(Self::Function),
            "math" => Ok(Self::Math),
            "external" | "ext" => Ok(Self::External),
            _ => Err(invalid_source(&s)),
        }
    }
}

/// Input producing the edge trigger
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TriggerSource {
    Channel(Channel),
    External,
    Line,
    Wavegen,
}

impl Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel(ch) => Display::fmt(ch, f),
            Self::External => f.write_str("EXTernal"),
            Self::Line => f.write_str("LINE"),
            Self::Wavegen => f.write_str("WGEN"),
        }
    }
}

impl FromStr for TriggerSource {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.to_lowercase();
        if let Some(ch) = parse_channel(&s)? {
            return Ok(Self::Channel(ch));
        }
        match s.as_str() {
            "external" | "ext" => Ok(Self::External),
            "line" => Ok(Self::Line),
            "wgen" | "wavegen" => Ok(Self::Wavegen),
            _ => Err(invalid_source(&s)),
        }
    }
}

/// Source a trigger level applies to
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LevelSource {
    Channel(Channel),
    External,
}

impl Display for LevelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel(ch) => Display::fmt(ch, f),
            Self::External => f.write_str("EXTernal"),
        }
    }
}

impl FromStr for LevelSource {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.to_lowercase();
        if let Some(ch) = parse_channel(&s)? {
            return Ok(Self::Channel(ch));
        }
        match s.as_str() {
            "external" | "ext" => Ok(Self::External),
            _ => Err(invalid_source(&s)),
        }
    }
}

fn numbered<'a>(s: &'a str, prefixes: &[&str]) -> Option<&'a str> {
    prefixes
        .iter()
        .find_map(|p| s.strip_prefix(*p))
        .filter(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
}

// Accepts "channel1", "chan1" and "1".
fn parse_channel(s: &str) -> Result<Option<Channel>> {
    let digits = if s.bytes().all(|b| b.is_ascii_digit()) && !s.is_empty() {
        Some(s)
    } else {
        numbered(s, &["channel", "chan"])
    };
    match digits {
        Some(n) => {
            let n = n.parse::<u8>().map_err(|_| invalid_source(s))?;
            Channel::new(n).map(Some)
        }
        None => Ok(None),
    }
}

fn invalid_source(s: &str) -> ProtoError {
    ProtoError::InvalidArgument(format!("Unknown source: {}", s))
}

/// Shorten a channel label the way the instrument does: at most
/// [`MAX_LABEL_LEN`] characters, upper case.
pub fn normalize_label(label: &str) -> Result<String> {
    if label.chars().any(|c| matches!(c, '\'' | '"' | '\n' | '\r')) {
        return Err(ProtoError::InvalidArgument(format!(
            "Label must not contain quotes or line breaks: {:?}",
            label
        )));
    }
    // Upper case first, it may change the number of characters.
    let upper = label.to_uppercase();
    let normalized: String = upper.chars().take(MAX_LABEL_LEN).collect();
    if upper.chars().count() > MAX_LABEL_LEN {
        log::warn!("label {:?} truncated to {:?}", label, normalized);
    }
    Ok(normalized)
}

/// Kind of reply a command produces.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    /// One line of text terminated by `\n`
    Text,
    /// Definite length arbitrary block
    Block,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ident,
    Single,
    Run,
    Stop,
    ChannelCoupling(Channel, Coupling),
    ChannelDisplay(Channel, bool),
    ChannelInvert(Channel, bool),
    ChannelLabel(Channel, String),
    ChannelOffset(Channel, f64, VoltUnit),
    ChannelProbe(Channel, f64),
    ChannelRange(Channel, f64, VoltUnit),
    ChannelScale(Channel, f64, VoltUnit),
    ChannelUnits(Channel, ProbeUnit),
    DisplayLabel(bool),
    DisplayData(Palette),
    MeasureClear,
    MeasureInstall(MeasurementKind, MeasurementSource),
    MeasureQuery(MeasurementKind, MeasurementSource),
    TimebaseScale(f64),
    TriggerHoldoff(f64),
    TriggerMode(TriggerMode),
    TriggerNoiseReject(bool),
    TriggerLevel(f64, LevelSource),
    TriggerSlope(Slope),
    TriggerSource(TriggerSource),
    WgenOutput(bool),
    WgenFrequency(f64),
    WgenFunction(WaveFunction),
    WgenPulseWidth(f64),
    WgenRampSymmetry(f64),
    WgenSquareDutyCycle(f64),
    WgenAmplitude(f64),
    WgenOffset(f64),
}

impl Command {
    /// Reply expected for this command, `None` for plain settings.
    pub fn response(&self) -> Option<ResponseKind> {
        match self {
            Command::Ident | Command::MeasureQuery(..) => Some(ResponseKind::Text),
            Command::DisplayData(_) => Some(ResponseKind::Block),
            _ => None,
        }
    }

    /// Check numeric arguments before anything is sent to the instrument.
    pub fn validate(&self) -> Result<()> {
        match self {
            Command::ChannelProbe(_, att) => check_range("Probe attenuation", *att, PROBE_ATTENUATION),
            Command::WgenRampSymmetry(percent) => check_range("Ramp symmetry", *percent, RAMP_SYMMETRY),
            Command::WgenSquareDutyCycle(percent) => {
                check_range("Square duty cycle", *percent, SQUARE_DUTY_CYCLE)
            }
            Command::ChannelLabel(_, label) => {
                if label.chars().count() > MAX_LABEL_LEN
                    || label.chars().any(|c| matches!(c, '\'' | '"' | '\n' | '\r'))
                {
                    Err(ProtoError::InvalidArgument(format!(
                        "Invalid channel label: {:?}",
                        label
                    )))
                } else {
                    Ok(())
                }
            }
            Command::MeasureInstall(_, source) | Command::MeasureQuery(_, source) => source.validate(),
            Command::ChannelOffset(_, v, _)
            | Command::ChannelRange(_, v, _)
            | Command::ChannelScale(_, v, _)
            | Command::TimebaseScale(v)
            | Command::TriggerHoldoff(v)
            | Command::TriggerLevel(v, _)
            | Command::WgenFrequency(v)
            | Command::WgenPulseWidth(v)
            | Command::WgenAmplitude(v)
            | Command::WgenOffset(v) => check_finite(*v),
            _ => Ok(()),
        }
    }
}

fn check_finite(value: f64) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ProtoError::InvalidArgument(format!(
            "Value must be finite, got {}",
            value
        )))
    }
}

fn check_range(name: &str, value: f64, range: RangeInclusive<f64>) -> Result<()> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ProtoError::InvalidArgument(format!(
            "{} must be in range {} .. {}, got {}",
            name,
            range.start(),
            range.end(),
            value
        )))
    }
}

struct Flag(bool);

impl Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0 { "1" } else { "0" })
    }
}

/// SCPI text of the command, without line terminator.
impl Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Ident => f.write_str("*IDN?"),
            Command::Single => f.write_str(":SINGle"),
            Command::Run => f.write_str(":RUN"),
            Command::Stop => f.write_str(":STOP"),
            Command::ChannelCoupling(ch, coupling) => write!(f, ":{}:COUPling {}", ch, coupling),
            Command::ChannelDisplay(ch, on) => write!(f, ":{}:DISPlay {}", ch, Flag(*on)),
            Command::ChannelInvert(ch, on) => write!(f, ":{}:INVert {}", ch, Flag(*on)),
            Command::ChannelLabel(ch, label) => write!(f, ":{}:LABel '{}'", ch, label),
            Command::ChannelOffset(ch, v, unit) => write!(f, ":{}:OFFSet {} {}", ch, v, unit),
            Command::ChannelProbe(ch, att) => write!(f, ":{}:PROBe {}", ch, att),
            Command::ChannelRange(ch, v, unit) => write!(f, ":{}:RANGe {} {}", ch, v, unit),
            Command::ChannelScale(ch, v, unit) => write!(f, ":{}:SCALe {} {}", ch, v, unit),
            Command::ChannelUnits(ch, unit) => write!(f, ":{}:UNITs {}", ch, unit),
            Command::DisplayLabel(on) => write!(f, ":DISPlay:LABel {}", Flag(*on)),
            Command::DisplayData(palette) => write!(f, ":DISPlay:DATA? PNG, {}", palette),
            Command::MeasureClear => f.write_str(":MEASure:CLEar"),
            Command::MeasureInstall(kind, source) => write!(f, ":MEASure:{} {}", kind, source),
            Command::MeasureQuery(kind, source) => write!(f, ":MEASure:{}? {}", kind, source),
            Command::TimebaseScale(s) => write!(f, ":TIMebase:SCALe {}", s),
            Command::TriggerHoldoff(s) => write!(f, ":TRIGger:HOLDoff {}", s),
            Command::TriggerMode(mode) => write!(f, ":TRIGger:MODE {}", mode),
            Command::TriggerNoiseReject(on) => write!(f, ":TRIGger:NREJect {}", Flag(*on)),
            Command::TriggerLevel(level, source) => {
                write!(f, ":TRIGger:EDGE:LEVel {}, {}", level, source)
            }
            Command::TriggerSlope(slope) => write!(f, ":TRIGger:EDGE:SLOPe {}", slope),
            Command::TriggerSource(source) => write!(f, ":TRIGger:EDGE:SOURce {}", source),
            Command::WgenOutput(on) => write!(f, ":WGEN:OUTPut {}", Flag(*on)),
            Command::WgenFrequency(hz) => write!(f, ":WGEN:FREQuency {}", hz),
            Command::WgenFunction(func) => write!(f, ":WGEN:FUNCtion {}", func),
            Command::WgenPulseWidth(s) => write!(f, ":WGEN:FUNCtion:PULSe:WIDTh {}", s),
            Command::WgenRampSymmetry(p) => write!(f, ":WGEN:FUNCtion:RAMP:SYMMetry {}", p),
            Command::WgenSquareDutyCycle(p) => write!(f, ":WGEN:FUNCtion:SQUare:DCYCle {}", p),
            Command::WgenAmplitude(v) => write!(f, ":WGEN:VOLTage {}", v),
            Command::WgenOffset(v) => write!(f, ":WGEN:VOLTage:OFFSet {}", v),
        }
    }
}
