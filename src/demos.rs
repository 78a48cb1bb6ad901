//! Ready-made jobs over [`CityReading`]s.
//!
//! Both key readings by city and emit the running aggregate of the
//! city after every reading.

use crate::errors::EngineResult;
use crate::inputs::CityReading;
use crate::job::Job;
use crate::operators::{AggregateFn, AggregatePolicy, LabelReplace, ReducePolicy};
use crate::recovery::model::StateKey;
use crate::state::StateDescriptor;

/// A city and its running total.
pub type CityTotal = (String, i64);

fn by_city(reading: &CityReading) -> StateKey {
    StateKey::new(reading.city.clone())
}

/// Sum the values of each city with a reducing state.
pub fn reducing_job() -> EngineResult<Job<CityReading, i64, i64>> {
    Job::builder("city-reduce", by_city)
        .state(StateDescriptor::new(
            "ReducingStateDesc",
            ReducePolicy::new(0, |reading: &CityReading| reading.value, |a, b| Ok(a + b)),
        ))
        .build()
}

/// Sum the values of each city with an aggregating state whose
/// accumulator remembers the city.
///
/// A reading from another city than the one in the accumulator
/// replaces the accumulator.
pub fn aggregating_job() -> EngineResult<Job<CityReading, CityTotal, CityTotal>> {
    let function = AggregateFn::new(
        || (String::new(), 0),
        |reading: &CityReading, acc: CityTotal| Ok((reading.city.clone(), acc.1 + reading.value)),
        |acc: &CityTotal| acc.clone(),
    );
    Job::builder("city-aggregate", by_city)
        .state(StateDescriptor::new(
            "AggregatingStateDesc",
            AggregatePolicy::new(LabelReplace::new(function)),
        ))
        .build()
}
