use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use crate::proto::command::{MeasurementKind, MeasurementSource};

/// A measured value together with what and when it was measured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub timestamp: DateTime<Local>,
    pub kind: MeasurementKind,
    pub source: String,
    pub value: f64,
    pub unit: String,
}

impl MeasurementRecord {
    pub fn new(kind: MeasurementKind, source: MeasurementSource, value: f64) -> Self {
        Self {
            timestamp: Local::now(),
            kind,
            source: source.to_string(),
            value,
            unit: unit_of(kind).to_string(),
        }
    }
}

/// Unit of a measurement result, for voltage probes.
pub fn unit_of(kind: MeasurementKind) -> &'static str {
    match kind {
        MeasurementKind::DutyCycle => "%",
        MeasurementKind::Frequency => "Hz",
        MeasurementKind::FallTime
        | MeasurementKind::RiseTime
        | MeasurementKind::XAtMaximum
        | MeasurementKind::XAtMinimum => "s",
        MeasurementKind::Amplitude
        | MeasurementKind::Average
        | MeasurementKind::Base
        | MeasurementKind::Top
        | MeasurementKind::Maximum
        | MeasurementKind::Minimum
        | MeasurementKind::PeakToPeak
        | MeasurementKind::Rms => "V",
    }
}

impl Display for MeasurementRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            write!(
                f,
                "{} {} {}: {} {}",
                self.timestamp.format("%H:%M:%S"),
                self.kind,
                self.source,
                self.value,
                self.unit
            )
        } else {
            write!(f, "{} {}", self.value, self.unit)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::command::Channel;

    #[test]
    fn test_record() {
        let source = MeasurementSource::Channel(Channel::new(1).unwrap());
        let rec = MeasurementRecord::new(MeasurementKind::Frequency, source, 1000.0);
        assert_eq!(rec.source, "CHANnel1");
        assert_eq!(rec.to_string(), "1000 Hz");
        assert!(format!("{:#}", rec).ends_with("FREQuency CHANnel1: 1000 Hz"));
    }

    #[test]
    fn test_record_json() {
        let source = MeasurementSource::Math;
        let rec = MeasurementRecord::new(MeasurementKind::PeakToPeak, source, 3.3);
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["kind"], "PeakToPeak");
        assert_eq!(json["source"], "MATH");
        assert_eq!(json["unit"], "V");
    }
}
