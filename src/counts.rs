//! Demographic bucket counters shared by records, rollups and stats responses

use crate::error::ApiError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The 12 counters carried by every detection record and rollup row:
/// {male, female} x {0-9, 10-19, 20-29, 30-39, 40-49, 50+}.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct BucketCounts {
    pub male_0_9: i64,
    pub male_10_19: i64,
    pub male_20_29: i64,
    pub male_30_39: i64,
    pub male_40_49: i64,
    pub male_50_plus: i64,
    pub female_0_9: i64,
    pub female_10_19: i64,
    pub female_20_29: i64,
    pub female_30_39: i64,
    pub female_40_49: i64,
    pub female_50_plus: i64,
}

impl BucketCounts {
    pub fn male(&self) -> i64 {
        self.male_0_9
            + self.male_10_19
            + self.male_20_29
            + self.male_30_39
            + self.male_40_49
            + self.male_50_plus
    }

    pub fn female(&self) -> i64 {
        self.female_0_9
            + self.female_10_19
            + self.female_20_29
            + self.female_30_39
            + self.female_40_49
            + self.female_50_plus
    }

    pub fn total(&self) -> i64 {
        self.male() + self.female()
    }

    pub fn add(&mut self, other: &BucketCounts) {
        self.male_0_9 += other.male_0_9;
        self.male_10_19 += other.male_10_19;
        self.male_20_29 += other.male_20_29;
        self.male_30_39 += other.male_30_39;
        self.male_40_49 += other.male_40_49;
        self.male_50_plus += other.male_50_plus;
        self.female_0_9 += other.female_0_9;
        self.female_10_19 += other.female_10_19;
        self.female_20_29 += other.female_20_29;
        self.female_30_39 += other.female_30_39;
        self.female_40_49 += other.female_40_49;
        self.female_50_plus += other.female_50_plus;
    }

    pub fn totals(&self) -> Totals {
        Totals {
            male: self.male(),
            female: self.female(),
            total: self.total(),
        }
    }

    pub fn percentages(&self) -> Percentages {
        let total = self.total();
        Percentages {
            male: percentage(self.male(), total),
            female: percentage(self.female(), total),
        }
    }

    pub fn demographics(&self) -> Demographics {
        Demographics {
            male: AgeBreakdown {
                age_0_9: self.male_0_9,
                age_10_19: self.male_10_19,
                age_20_29: self.male_20_29,
                age_30_39: self.male_30_39,
                age_40_49: self.male_40_49,
                age_50_plus: self.male_50_plus,
            },
            female: AgeBreakdown {
                age_0_9: self.female_0_9,
                age_10_19: self.female_10_19,
                age_20_29: self.female_20_29,
                age_30_39: self.female_30_39,
                age_40_49: self.female_40_49,
                age_50_plus: self.female_50_plus,
            },
        }
    }

    fn has_negative(&self) -> bool {
        [
            self.male_0_9,
            self.male_10_19,
            self.male_20_29,
            self.male_30_39,
            self.male_40_49,
            self.male_50_plus,
            self.female_0_9,
            self.female_10_19,
            self.female_20_29,
            self.female_30_39,
            self.female_40_49,
            self.female_50_plus,
        ]
        .iter()
        .any(|c| *c < 0)
    }
}

/// Percentage of `part` in `total`, rounded to one decimal. Empty totals
/// render as 0.0 rather than null.
pub fn percentage(part: i64, total: i64) -> f64 {
    if total > 0 {
        ((part as f64 / total as f64) * 1000.0).round() / 10.0
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub male: i64,
    pub female: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Percentages {
    pub male: f64,
    pub female: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeBreakdown {
    #[serde(rename = "0-9")]
    pub age_0_9: i64,
    #[serde(rename = "10-19")]
    pub age_10_19: i64,
    #[serde(rename = "20-29")]
    pub age_20_29: i64,
    #[serde(rename = "30-39")]
    pub age_30_39: i64,
    #[serde(rename = "40-49")]
    pub age_40_49: i64,
    #[serde(rename = "50+")]
    pub age_50_plus: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Demographics {
    pub male: AgeBreakdown,
    pub female: AgeBreakdown,
}

/// Ingestion payload. Detector scripts send either the full per-age
/// breakdown or a simplified pair of totals; both decode into one canonical
/// `BucketCounts`, the simplified totals landing in the 20-29 bucket.
#[derive(Debug, Deserialize)]
pub struct DetectionPayload {
    pub timestamp: DateTime<Utc>,
    pub detections: SexPair,
}

#[derive(Debug, Deserialize)]
pub struct SexPair {
    pub male: CountShape,
    pub female: CountShape,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum CountShape {
    Detailed(AgeBreakdown),
    Simple(i64),
}

impl DetectionPayload {
    /// Validates the payload and flattens it into bucket counters.
    /// Mixed shapes (one sex detailed, the other a bare integer) are
    /// rejected, as are negative counts.
    pub fn into_counts(self) -> Result<(DateTime<Utc>, BucketCounts), ApiError> {
        let counts = match (self.detections.male, self.detections.female) {
            (CountShape::Detailed(male), CountShape::Detailed(female)) => BucketCounts {
                male_0_9: male.age_0_9,
                male_10_19: male.age_10_19,
                male_20_29: male.age_20_29,
                male_30_39: male.age_30_39,
                male_40_49: male.age_40_49,
                male_50_plus: male.age_50_plus,
                female_0_9: female.age_0_9,
                female_10_19: female.age_10_19,
                female_20_29: female.age_20_29,
                female_30_39: female.age_30_39,
                female_40_49: female.age_40_49,
                female_50_plus: female.age_50_plus,
            },
            (CountShape::Simple(male), CountShape::Simple(female)) => BucketCounts {
                male_20_29: male,
                female_20_29: female,
                ..BucketCounts::default()
            },
            _ => {
                return Err(ApiError::validation(
                    "INVALID_PAYLOAD_FORMAT",
                    "detections must contain either detailed age objects or simple \
                     male/female integer counts for both sexes",
                ))
            }
        };

        if counts.has_negative() {
            return Err(ApiError::validation(
                "NEGATIVE_COUNT",
                "detection counts must not be negative",
            ));
        }

        Ok((self.timestamp, counts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(body: &str) -> Result<(DateTime<Utc>, BucketCounts), ApiError> {
        let payload: DetectionPayload = serde_json::from_str(body).unwrap();
        payload.into_counts()
    }

    #[test]
    fn detailed_payload_maps_all_buckets() {
        let (_, counts) = decode(
            r#"{
                "timestamp": "2026-08-25T10:30:00Z",
                "detections": {
                    "male": {"0-9": 1, "10-19": 2, "20-29": 3, "30-39": 4, "40-49": 5, "50+": 6},
                    "female": {"0-9": 6, "10-19": 5, "20-29": 4, "30-39": 3, "40-49": 2, "50+": 1}
                }
            }"#,
        )
        .unwrap();
        assert_eq!(counts.male(), 21);
        assert_eq!(counts.female(), 21);
        assert_eq!(counts.total(), 42);
        assert_eq!(counts.male_50_plus, 6);
        assert_eq!(counts.female_0_9, 6);
    }

    #[test]
    fn simple_payload_folds_into_20_29() {
        let (_, counts) = decode(
            r#"{"timestamp": "2026-08-25T10:30:00Z", "detections": {"male": 5, "female": 7}}"#,
        )
        .unwrap();
        assert_eq!(counts.male_20_29, 5);
        assert_eq!(counts.female_20_29, 7);
        assert_eq!(counts.total(), 12);
        assert_eq!(counts.male_0_9, 0);
    }

    #[test]
    fn mixed_shapes_rejected() {
        let err = decode(
            r#"{
                "timestamp": "2026-08-25T10:30:00Z",
                "detections": {
                    "male": {"0-9": 0, "10-19": 0, "20-29": 1, "30-39": 0, "40-49": 0, "50+": 0},
                    "female": 7
                }
            }"#,
        )
        .unwrap_err();
        assert_eq!(err.code(), "INVALID_PAYLOAD_FORMAT");
    }

    #[test]
    fn negative_counts_rejected() {
        let err = decode(
            r#"{"timestamp": "2026-08-25T10:30:00Z", "detections": {"male": -1, "female": 7}}"#,
        )
        .unwrap_err();
        assert_eq!(err.code(), "NEGATIVE_COUNT");
    }

    #[test]
    fn incomplete_detailed_shape_fails_decode() {
        // Missing age keys match neither untagged variant.
        let result = serde_json::from_str::<DetectionPayload>(
            r#"{
                "timestamp": "2026-08-25T10:30:00Z",
                "detections": {"male": {"0-9": 1}, "female": {"0-9": 1}}
            }"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn percentages_round_to_one_decimal() {
        let mut counts = BucketCounts::default();
        counts.male_20_29 = 1;
        counts.female_20_29 = 2;
        let p = counts.percentages();
        assert_eq!(p.male, 33.3);
        assert_eq!(p.female, 66.7);
    }

    #[test]
    fn empty_percentages_are_zero() {
        let p = BucketCounts::default().percentages();
        assert_eq!(p.male, 0.0);
        assert_eq!(p.female, 0.0);
    }

    #[test]
    fn add_is_per_bucket() {
        let mut a = BucketCounts {
            male_0_9: 1,
            female_50_plus: 2,
            ..BucketCounts::default()
        };
        let b = BucketCounts {
            male_0_9: 3,
            female_50_plus: 4,
            male_40_49: 5,
            ..BucketCounts::default()
        };
        a.add(&b);
        assert_eq!(a.male_0_9, 4);
        assert_eq!(a.female_50_plus, 6);
        assert_eq!(a.male_40_49, 5);
        assert_eq!(a.total(), 15);
    }
}
