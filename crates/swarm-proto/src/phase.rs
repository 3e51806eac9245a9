use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlightPhase {
    Disconnected,
    Connected,
    Armed,
    TakingOff,
    Airborne,
    ManualOverride,
    Landing,
    Disarmed,
    Failed,
}

impl FlightPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, FlightPhase::Disarmed | FlightPhase::Failed)
    }

    /// True while the vehicle may be off the ground.
    pub fn is_airborne(self) -> bool {
        matches!(
            self,
            FlightPhase::TakingOff | FlightPhase::Airborne | FlightPhase::ManualOverride | FlightPhase::Landing
        )
    }

    pub fn can_transition_to(self, next: FlightPhase) -> bool {
        use FlightPhase::*;
        match (self, next) {
            (Disarmed | Failed, _) => false,
            (_, Failed) => true,
            (Disconnected, Connected)
            | (Connected, Armed)
            | (Armed, TakingOff)
            | (TakingOff, Airborne)
            | (Armed | Airborne, ManualOverride)
            | (Airborne | ManualOverride, Landing)
            | (Landing, Disarmed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: FlightPhase,
    pub to: FlightPhase,
    pub at_unix_ms: i64,
}
