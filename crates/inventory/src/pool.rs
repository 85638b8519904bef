//! Recycles [`InventoryDeductionRequest`] buffers across messages.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, PoisonError};

use crate::InventoryDeductionRequest;

pub struct RequestPool {
    idle: Mutex<Vec<InventoryDeductionRequest>>,
    max_idle: usize,
}

impl Default for RequestPool {
    fn default() -> Self {
        Self::new(64)
    }
}

impl RequestPool {
    pub fn new(max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    /// Hands out a reset request; it goes back to the pool when dropped.
    pub fn acquire(&self) -> PooledRequest<'_> {
        let request = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_default();
        PooledRequest {
            pool: self,
            request,
        }
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn release(&self, mut request: InventoryDeductionRequest) {
        request.reset();
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.max_idle {
            idle.push(request);
        }
    }
}

pub struct PooledRequest<'a> {
    pool: &'a RequestPool,
    request: InventoryDeductionRequest,
}

impl Deref for PooledRequest<'_> {
    type Target = InventoryDeductionRequest;

    fn deref(&self) -> &Self::Target {
        &self.request
    }
}

impl DerefMut for PooledRequest<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.request
    }
}

impl Drop for PooledRequest<'_> {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.request));
    }
}
