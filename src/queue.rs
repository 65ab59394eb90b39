//! Bounded MPMC queue used at every ingest boundary.
//!
//! A full queue raises `Capacity` synchronously to the producer instead
//! of blocking; the queue owner never retries internally.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use crate::error::{CepError, Result};

#[derive(Debug)]
pub struct BoundedQueue<T> {
    label: &'static str,
    capacity: usize,
    items: Mutex<VecDeque<T>>,
}

impl<T> BoundedQueue<T> {
    pub fn new(label: &'static str, capacity: usize) -> Self {
        Self {
            label,
            capacity,
            items: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, item: T) -> Result<()> {
        let mut q = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        if q.len() >= self.capacity {
            return Err(CepError::Capacity {
                queue: self.label,
                capacity: self.capacity,
            });
        }
        q.push_back(item);
        Ok(())
    }

    pub fn pop(&self) -> Option<T> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
