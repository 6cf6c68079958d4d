//! Fetched envelope returned to the query cache
//!
//! A fetcher never throws: it hands the cache either `Data` (with the times
//! that drive refetch cooldown and eviction) or `Fail`.

use std::time::{Duration, SystemTime};

/// Successful fetch
#[derive(Debug, Clone, PartialEq)]
pub struct Data<T> {
    pub value: T,
    pub time: SystemTime,
    /// No refetch before this instant
    pub cooldown: Option<SystemTime>,
    /// Evict after this instant
    pub expiration: Option<SystemTime>,
}

impl<T> Data<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            time: SystemTime::now(),
            cooldown: None,
            expiration: None,
        }
    }

    pub fn with_cooldown(mut self, delay: Duration) -> Self {
        self.cooldown = Some(self.time + delay);
        self
    }

    pub fn with_expiration(mut self, delay: Duration) -> Self {
        self.expiration = Some(self.time + delay);
        self
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expiration.map_or(false, |expiration| now >= expiration)
    }
}

/// Failed fetch
#[derive(Debug, Clone, PartialEq)]
pub struct Fail<E> {
    pub error: E,
    pub time: SystemTime,
}

impl<E> Fail<E> {
    pub fn new(error: E) -> Self {
        Self {
            error,
            time: SystemTime::now(),
        }
    }
}

/// Outcome of one fetcher invocation
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched<T, E> {
    Data(Data<T>),
    Fail(Fail<E>),
}

impl<T, E> Fetched<T, E> {
    pub fn is_data(&self) -> bool {
        matches!(self, Self::Data(_))
    }

    pub fn into_result(self) -> Result<T, E> {
        match self {
            Self::Data(data) => Ok(data.value),
            Self::Fail(fail) => Err(fail.error),
        }
    }
}

impl<T, E> From<Result<T, E>> for Fetched<T, E> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Self::Data(Data::new(value)),
            Err(error) => Self::Fail(Fail::new(error)),
        }
    }
}
