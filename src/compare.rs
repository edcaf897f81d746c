use serde::{Deserialize, Serialize};

/// Seconds between the Unix epoch and the GPS epoch (1980-01-06T00:00:00Z).
pub const GPS_EPOCH_UNIX_S: f64 = 315_964_800.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    InSync,
    Drifting,
    ReferenceUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    /// GPS time on the Unix timescale.
    pub gps_time_s: f64,
    pub local_time_s: f64,
    pub reference_time_s: Option<f64>,
    pub gps_vs_local_s: f64,
    pub gps_vs_reference_s: Option<f64>,
    pub local_vs_reference_s: Option<f64>,
    pub classification: Classification,
}

impl DriftReport {
    /// How far the GPS clock trails the host clock.
    pub fn gps_lag_s(&self) -> f64 {
        -self.gps_vs_local_s
    }
}

/// How the payload's GPS timestamp counts seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBase {
    /// Already Unix seconds.
    Unix,
    /// Seconds since the GPS epoch; GPS runs ahead of UTC by the leap second count.
    Gps { leap_seconds: i32 },
}

impl TimeBase {
    pub fn to_unix(&self, raw_s: f64) -> f64 {
        match *self {
            TimeBase::Unix => raw_s,
            TimeBase::Gps { leap_seconds } => raw_s + GPS_EPOCH_UNIX_S - leap_seconds as f64,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClockComparator {
    tolerance_s: f64,
}

impl ClockComparator {
    pub fn new(tolerance_s: f64) -> Self {
        ClockComparator { tolerance_s }
    }

    pub fn tolerance_s(&self) -> f64 {
        self.tolerance_s
    }

    /// Compare the three clocks. Staleness of `gps_time_s` is the caller's concern.
    pub fn compare(
        &self,
        gps_time_s: f64,
        local_time_s: f64,
        reference_time_s: Option<f64>,
    ) -> DriftReport {
        let gps_vs_local_s = gps_time_s - local_time_s;

        let Some(reference) = reference_time_s else {
            return DriftReport {
                gps_time_s,
                local_time_s,
                reference_time_s: None,
                gps_vs_local_s,
                gps_vs_reference_s: None,
                local_vs_reference_s: None,
                classification: Classification::ReferenceUnavailable,
            };
        };

        let gps_vs_reference_s = gps_time_s - reference;
        let local_vs_reference_s = local_time_s - reference;

        let classification = if gps_vs_reference_s.abs() > self.tolerance_s
            || local_vs_reference_s.abs() > self.tolerance_s
        {
            Classification::Drifting
        } else {
            Classification::InSync
        };

        DriftReport {
            gps_time_s,
            local_time_s,
            reference_time_s: Some(reference),
            gps_vs_local_s,
            gps_vs_reference_s: Some(gps_vs_reference_s),
            local_vs_reference_s: Some(local_vs_reference_s),
            classification,
        }
    }
}

impl Default for ClockComparator {
    fn default() -> Self {
        ClockComparator::new(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-6;

    #[test]
    fn test_identical_clocks_in_sync() {
        let t = 1_446_994_128.52;
        let r = ClockComparator::default().compare(t, t, Some(t));
        assert_eq!(r.classification, Classification::InSync);
        assert!(r.gps_vs_local_s.abs() < EPS);
        assert!(r.gps_vs_reference_s.unwrap().abs() < EPS);
        assert!(r.local_vs_reference_s.unwrap().abs() < EPS);
    }

    #[test]
    fn test_reference_payload_scenario() {
        let r = ClockComparator::new(1.0).compare(1446994128.52, 1446994129.0, Some(1446994128.6));
        assert!((r.gps_vs_reference_s.unwrap() - -0.08).abs() < EPS);
        assert!((r.local_vs_reference_s.unwrap() - 0.40).abs() < EPS);
        assert!((r.gps_vs_local_s - -0.48).abs() < EPS);
        assert_eq!(r.classification, Classification::InSync);
    }

    #[test]
    fn test_reference_unavailable() {
        let r = ClockComparator::new(1.0).compare(1446994128.52, 1446994129.0, None);
        assert_eq!(r.classification, Classification::ReferenceUnavailable);
        assert_eq!(r.reference_time_s, None);
        assert_eq!(r.gps_vs_reference_s, None);
        assert_eq!(r.local_vs_reference_s, None);
        assert!((r.gps_vs_local_s - -0.48).abs() < EPS);
    }

    #[test]
    fn test_gps_drifting() {
        let r = ClockComparator::new(1.0).compare(1000.0, 2000.2, Some(2000.0));
        assert_eq!(r.classification, Classification::Drifting);
        assert_eq!(r.gps_vs_reference_s, Some(-1000.0));
    }

    #[test]
    fn test_local_drifting() {
        let r = ClockComparator::new(0.5).compare(100.0, 101.0, Some(100.1));
        assert_eq!(r.classification, Classification::Drifting);
    }

    #[test]
    fn test_tolerance_boundary_is_in_sync() {
        // exactly at tolerance is not drifting
        let r = ClockComparator::new(1.0).compare(101.0, 99.0, Some(100.0));
        assert_eq!(r.classification, Classification::InSync);
    }

    #[test]
    fn test_time_base_unix_passthrough() {
        assert_eq!(TimeBase::Unix.to_unix(1446994128.52), 1446994128.52);
    }

    #[test]
    fn test_time_base_gps_epoch() {
        let base = TimeBase::Gps { leap_seconds: 18 };
        assert_eq!(base.to_unix(0.0), GPS_EPOCH_UNIX_S - 18.0);
        // 2015-11-08T14:48:48Z is 1131029345 GPS seconds with 17 leap seconds
        let base = TimeBase::Gps { leap_seconds: 17 };
        assert_eq!(base.to_unix(1_131_029_345.0), 1_446_994_128.0);
    }

    #[test]
    fn test_classification_serializes_screaming() {
        let s = serde_json::to_string(&Classification::ReferenceUnavailable).unwrap();
        assert_eq!(s, "\"REFERENCE_UNAVAILABLE\"");
        let s = serde_json::to_string(&Classification::InSync).unwrap();
        assert_eq!(s, "\"IN_SYNC\"");
    }
}
