use crate::types::HvacMode;

/// A command the controller issued and when.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IssuedCommand<T> {
    pub value: T,
    pub at_ms: u64,
}

impl<T> IssuedCommand<T> {
    pub fn new(value: T, at_ms: u64) -> Self {
        Self { value, at_ms }
    }

    pub fn within(&self, window_ms: u64, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.at_ms) < window_ms
    }
}

/// A scheduled retry. Dropping the handle cancels it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryTimer<T> {
    pub due_ms: u64,
    pub armed_for: T,
}

impl<T> RetryTimer<T> {
    pub fn is_due(&self, now_ms: u64) -> bool {
        now_ms >= self.due_ms
    }
}

/// Per-device command bookkeeping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandLedger {
    pub last_hvac_command: Option<IssuedCommand<HvacMode>>,
    pub last_temp_command: Option<IssuedCommand<f32>>,
    pub pending_mode: Option<HvacMode>,
    pub pending_temperature: Option<f32>,
    pub hvac_retry: Option<RetryTimer<HvacMode>>,
    pub temp_retry: Option<RetryTimer<f32>>,
    pub adopted_temperature: Option<f32>,
}

impl CommandLedger {
    /// Arms the mode retry, replacing any live one.
    pub fn arm_hvac_retry(&mut self, mode: HvacMode, due_ms: u64) {
        self.pending_mode = Some(mode);
        self.hvac_retry = Some(RetryTimer {
            due_ms,
            armed_for: mode,
        });
    }

    pub fn arm_temp_retry(&mut self, value: f32, due_ms: u64) {
        self.temp_retry = Some(RetryTimer {
            due_ms,
            armed_for: value,
        });
    }

    pub fn cancel_hvac_retry(&mut self) {
        self.hvac_retry = None;
    }

    pub fn cancel_temp_retry(&mut self) {
        self.temp_retry = None;
    }

    /// Drops everything tracked for the mode command once the device
    /// reports the requested mode.
    pub fn confirm_mode(&mut self) {
        self.pending_mode = None;
        self.hvac_retry = None;
        self.last_hvac_command = None;
    }

    pub fn confirm_temperature(&mut self, reported: f32) {
        self.pending_temperature = None;
        self.adopted_temperature = Some(reported);
        self.last_temp_command = None;
        self.temp_retry = None;
    }

    pub fn take_due_hvac_retry(&mut self, now_ms: u64) -> Option<RetryTimer<HvacMode>> {
        if self.hvac_retry.is_some_and(|timer| timer.is_due(now_ms)) {
            self.hvac_retry.take()
        } else {
            None
        }
    }

    pub fn take_due_temp_retry(&mut self, now_ms: u64) -> Option<RetryTimer<f32>> {
        if self.temp_retry.is_some_and(|timer| timer.is_due(now_ms)) {
            self.temp_retry.take()
        } else {
            None
        }
    }

    pub fn cancel_all(&mut self) {
        self.hvac_retry = None;
        self.temp_retry = None;
    }
}
