//! Hosted builds run without interrupts; the enable flag is always set.

pub fn intr_enabled() -> bool {
    true
}

pub fn intr_disable() -> bool {
    true
}

pub fn intr_restore(_was_enabled: bool) {}
