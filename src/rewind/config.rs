use crate::RewindError;

/// How `RewindData::find_valid_resim_frame` decides a frame is a usable rewind target.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ResimFrameValidation {
    /// Every particle that has ever received targets must have one on the frame.
    EntireFrame,
    /// Only particles flagged as needing a resim must have a target on the frame.
    #[default]
    Particle,
}

/// Construction-time settings of a `RewindData`.
#[derive(Clone, Debug, PartialEq)]
pub struct RewindConfig {
    /// Frames of history retained. The frame manager ring holds one more slot.
    pub num_frames: usize,
    /// When set, objects not flagged for a full resim replay their recorded state as followers.
    pub rewind_data_optimization: bool,
    /// Record only `PostPushData` per frame, shrinking every history ring to one entry per frame.
    pub cache_one_phase: bool,
    /// Keep an external resim cache per frame.
    pub use_collision_resim_cache: bool,
    /// Disables target comparison, `compare_targets_to_last_frame` never reports a desync.
    pub skip_desync_test: bool,
    pub position_threshold: f32,
    pub rotation_threshold_degrees: f32,
    pub linear_velocity_threshold: f32,
    pub angular_velocity_threshold: f32,
    pub resim_frame_validation: ResimFrameValidation,
}

impl Default for RewindConfig {
    fn default() -> Self {
        Self {
            num_frames: 64,
            rewind_data_optimization: false,
            cache_one_phase: false,
            use_collision_resim_cache: false,
            skip_desync_test: false,
            position_threshold: 0.01,
            rotation_threshold_degrees: 1.0,
            linear_velocity_threshold: 0.05,
            angular_velocity_threshold: 0.05,
            resim_frame_validation: ResimFrameValidation::default(),
        }
    }
}

impl RewindConfig {
    pub fn with_num_frames(mut self, num_frames: usize) -> Self {
        self.num_frames = num_frames;
        self
    }

    pub fn with_rewind_data_optimization(mut self, enabled: bool) -> Self {
        self.rewind_data_optimization = enabled;
        self
    }

    pub fn with_cache_one_phase(mut self, enabled: bool) -> Self {
        self.cache_one_phase = enabled;
        self
    }

    pub fn with_collision_resim_cache(mut self, enabled: bool) -> Self {
        self.use_collision_resim_cache = enabled;
        self
    }

    pub fn with_skip_desync_test(mut self, skip: bool) -> Self {
        self.skip_desync_test = skip;
        self
    }

    pub fn with_position_threshold(mut self, threshold: f32) -> Self {
        self.position_threshold = threshold;
        self
    }

    pub fn with_rotation_threshold_degrees(mut self, threshold: f32) -> Self {
        self.rotation_threshold_degrees = threshold;
        self
    }

    pub fn with_velocity_thresholds(mut self, linear: f32, angular: f32) -> Self {
        self.linear_velocity_threshold = linear;
        self.angular_velocity_threshold = angular;
        self
    }

    pub fn with_resim_frame_validation(mut self, validation: ResimFrameValidation) -> Self {
        self.resim_frame_validation = validation;
        self
    }

    pub fn validate(&self) -> Result<(), RewindError> {
        if self.num_frames == 0 {
            return Err(RewindError::InvalidConfig(
                "num_frames must be at least 1".to_string(),
            ));
        }
        if self.num_frames >= i32::MAX as usize / crate::history::NUM_PHASES {
            return Err(RewindError::InvalidConfig(format!(
                "num_frames {} is too large",
                self.num_frames
            )));
        }
        let thresholds = [
            ("position_threshold", self.position_threshold),
            ("rotation_threshold_degrees", self.rotation_threshold_degrees),
            ("linear_velocity_threshold", self.linear_velocity_threshold),
            ("angular_velocity_threshold", self.angular_velocity_threshold),
        ];
        for (name, value) in thresholds {
            if value.is_nan() || value < 0.0 {
                return Err(RewindError::InvalidConfig(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }
        Ok(())
    }
}
