/// Governs the behaviour of every Context mutator (spec §4.1). Defaults
/// match the original implementation's `Knowledge_Update_Settings`: signal
/// and expansion are on by default, the rest are conservative no-ops.
#[derive(Clone, Copy, Debug)]
pub struct UpdateSettings {
    pub treat_globals_as_locals: bool,
    pub signal_changes: bool,
    pub always_overwrite: bool,
    pub expand_variables: bool,
    pub track_local_changes: bool,
    pub clock_increment: u64,
    pub delay_sending_modifieds: bool,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        UpdateSettings {
            treat_globals_as_locals: false,
            signal_changes: true,
            always_overwrite: false,
            expand_variables: true,
            track_local_changes: false,
            clock_increment: 1,
            delay_sending_modifieds: false,
        }
    }
}

impl UpdateSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn always_overwriting() -> Self {
        UpdateSettings {
            always_overwrite: true,
            ..Self::default()
        }
    }
}

/// Return codes for setters, per spec §6: 0 = accepted, -1 = null/empty
/// key, -2 = insufficient write-quality, -3 = type coercion rejected.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SetResult {
    Accepted,
    InvalidKey,
    QualityRejected,
    TypeRejected,
}

impl SetResult {
    pub fn code(self) -> i32 {
        match self {
            SetResult::Accepted => 0,
            SetResult::InvalidKey => -1,
            SetResult::QualityRejected => -2,
            SetResult::TypeRejected => -3,
        }
    }

    pub fn is_accepted(self) -> bool {
        matches!(self, SetResult::Accepted)
    }
}
