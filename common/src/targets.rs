use crate::types::HvacMode;

pub const DEFAULT_TARGET: f32 = 22.0;
pub const DEFAULT_HEAT_TARGET: f32 = 20.0;
pub const DEFAULT_COOL_TARGET: f32 = 25.0;

/// Heat/cool setpoints plus the single displayed target.
///
/// After `apply_limits` the setpoints satisfy
/// `min <= heat <= cool <= max`.
#[derive(Debug, Clone, PartialEq)]
pub struct Targets {
    heat: f32,
    cool: f32,
    target: f32,
    min: f32,
    max: f32,
}

impl Targets {
    pub fn new(min: f32, max: f32) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        let mut targets = Self {
            heat: DEFAULT_HEAT_TARGET,
            cool: DEFAULT_COOL_TARGET,
            target: DEFAULT_TARGET,
            min,
            max,
        };
        targets.apply_limits(HvacMode::Off, HvacMode::Heat);
        targets
    }

    pub fn heat(&self) -> f32 {
        self.heat
    }

    pub fn cool(&self) -> f32 {
        self.cool
    }

    /// Displayed single-value target.
    pub fn target(&self) -> f32 {
        self.target
    }

    pub fn min(&self) -> f32 {
        self.min
    }

    pub fn max(&self) -> f32 {
        self.max
    }

    pub fn clamp(&self, value: f32) -> f32 {
        value.clamp(self.min, self.max)
    }

    pub fn set_heat(&mut self, value: f32) {
        self.heat = self.clamp(value);
    }

    pub fn set_cool(&mut self, value: f32) {
        self.cool = self.clamp(value);
    }

    pub fn set_target(&mut self, value: f32) {
        self.target = self.clamp(value);
    }

    /// Re-clamps both setpoints and repairs an inverted pair by moving the
    /// setpoint that does not belong to the active mode.
    pub fn apply_limits(&mut self, mode: HvacMode, last_active: HvacMode) {
        self.heat = self.clamp(self.heat);
        self.cool = self.clamp(self.cool);

        if self.heat > self.cool {
            match mode {
                HvacMode::Cool => self.heat = self.cool,
                HvacMode::Heat => self.cool = self.heat,
                HvacMode::Off if last_active == HvacMode::Cool => self.heat = self.cool,
                HvacMode::Off => self.cool = self.heat,
            }
        }

        self.target = match mode {
            HvacMode::Heat => self.heat,
            HvacMode::Cool => self.cool,
            HvacMode::Off => self.clamp(self.target),
        };
    }
}
