// Scheduling engine: binds schedules to a host timer facility and drives
// the fire-execute-reschedule cycle.

pub mod engine;
pub mod timer;

pub use engine::{SchedulingEngine, SchedulingEngineConfig, TemplateScheduleState};
pub use timer::{HostTimerFacility, InProcessTimerFacility, TimerEntry};
