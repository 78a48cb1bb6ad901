use std::task::Poll;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Source, SourceBuilder};
use crate::errors::EngineResult;
use crate::operators::Labeled;
use crate::recovery::model::SourceOffset;

/// A reading from a city: `SZ` readings count 1, `BJ` readings count
/// 10.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CityReading {
    pub city: String,
    pub value: i64,
    pub at: DateTime<Utc>,
}

impl Labeled for CityReading {
    type Label = String;

    fn label(&self) -> &String {
        &self.city
    }
}

/// Generates an endless (or `limit` long) stream of [`CityReading`]s.
///
/// The reading at each offset is a pure function of the seed and the
/// offset, so a source rebuilt at an offset continues with exactly the
/// readings the original would have produced.
#[derive(Debug, Clone)]
pub struct CityInput {
    seed: u64,
    start_at: DateTime<Utc>,
    pace: Option<Duration>,
    limit: Option<u64>,
}

impl CityInput {
    pub fn new(seed: u64, start_at: DateTime<Utc>) -> Self {
        Self {
            seed,
            start_at,
            pace: None,
            limit: None,
        }
    }

    /// Emit at most one reading per `pace`.
    pub fn paced(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }

    /// End the stream after `limit` readings.
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// The reading at a given offset.
    pub fn reading_at(&self, offset: u64) -> CityReading {
        let rng = fastrand::Rng::with_seed(self.seed ^ offset.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let (city, value) = if rng.bool() { ("SZ", 1) } else { ("BJ", 10) };
        // One reading per second, like the paced generator.
        let at = self.start_at + chrono::Duration::seconds(offset as i64);
        CityReading {
            city: city.to_string(),
            value,
            at,
        }
    }
}

impl SourceBuilder<CityReading> for CityInput {
    fn build(
        &self,
        resume_from: Option<SourceOffset>,
    ) -> EngineResult<Box<dyn Source<CityReading>>> {
        let position = resume_from.unwrap_or_default().0;
        tracing::info!("City input starting at offset {position}");
        Ok(Box::new(CitySource {
            input: self.clone(),
            position,
            last_emit: None,
            cancelled: false,
        }))
    }
}

struct CitySource {
    input: CityInput,
    position: u64,
    last_emit: Option<Instant>,
    cancelled: bool,
}

impl Source<CityReading> for CitySource {
    fn next(&mut self) -> Poll<Option<CityReading>> {
        if self.cancelled || self.input.limit.map_or(false, |limit| self.position >= limit) {
            return Poll::Ready(None);
        }
        if let (Some(pace), Some(last_emit)) = (self.input.pace, self.last_emit) {
            if last_emit.elapsed() < pace {
                return Poll::Pending;
            }
        }
        let reading = self.input.reading_at(self.position);
        self.position += 1;
        self.last_emit = Some(Instant::now());
        Poll::Ready(Some(reading))
    }

    fn snapshot(&self) -> SourceOffset {
        SourceOffset(self.position)
    }

    fn cancel(&mut self) {
        self.cancelled = true;
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn input() -> CityInput {
        CityInput::new(7, Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap()).limit(20)
    }

    fn drain(source: &mut Box<dyn Source<CityReading>>) -> Vec<CityReading> {
        let mut readings = Vec::new();
        while let Poll::Ready(Some(reading)) = source.next() {
            readings.push(reading);
        }
        readings
    }

    #[test]
    fn readings_are_sz_one_or_bj_ten() {
        let mut source = input().build(None).unwrap();
        let readings = drain(&mut source);
        assert_eq!(readings.len(), 20);
        for reading in readings {
            match reading.city.as_str() {
                "SZ" => assert_eq!(reading.value, 1),
                "BJ" => assert_eq!(reading.value, 10),
                other => panic!("unexpected city {other}"),
            }
        }
    }

    #[test]
    fn resumed_source_replays_same_readings() {
        let all = drain(&mut input().build(None).unwrap());
        let tail = drain(&mut input().build(Some(SourceOffset(12))).unwrap());
        assert_eq!(tail, all[12..].to_vec());
    }

    #[test]
    fn paced_source_waits() {
        let mut source = input().paced(Duration::from_secs(3600)).build(None).unwrap();
        assert!(matches!(source.next(), Poll::Ready(Some(_))));
        assert_eq!(source.next(), Poll::Pending);
        assert_eq!(source.snapshot(), SourceOffset(1));
    }
}
