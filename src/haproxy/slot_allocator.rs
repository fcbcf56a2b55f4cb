//! Server slot sizing for HAProxy backends.
//!
//! A backend always carries at least `base` slots. Above the base the count
//! grows linearly or exponentially so that scale-out does not churn the
//! backend shape on every single instance added.

use crate::config::{GrowthType, ServerSlotsConfig};

pub struct SlotAllocator {
    base: usize,
    growth_factor: f64,
    growth_type: GrowthType,
}

impl SlotAllocator {
    pub fn new(config: &ServerSlotsConfig) -> Self {
        Self {
            base: config.base as usize,
            growth_factor: config.growth_factor,
            growth_type: config.growth_type,
        }
    }

    /// The desired slot count for `active` instances. The reconciler takes
    /// the max of this and the backend's current size, so backends grow but
    /// never shrink.
    pub fn slot_count(&self, active: usize) -> usize {
        if active <= self.base {
            return self.base;
        }

        match self.growth_type {
            GrowthType::Linear => {
                let extra = ((active - self.base) as f64 * self.growth_factor).ceil() as usize;
                self.base + extra
            }
            GrowthType::Exponential => {
                // Smallest ceil(base * factor^k) that covers the active
                // count. growth_factor > 1 is enforced at config load.
                let mut k = 0i32;
                loop {
                    let slots = (self.base as f64 * self.growth_factor.powi(k)).ceil() as usize;
                    if slots >= active {
                        return slots;
                    }
                    k += 1;
                }
            }
        }
    }

    /// Deterministic slot name for an index. Names are index-stable for the
    /// lifetime of a backend: growth appends, it never renames.
    pub fn server_name(index: usize) -> String {
        format!("srv{index}")
    }
}
