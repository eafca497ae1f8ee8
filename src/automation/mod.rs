//! Automation: rules, the matcher that schedules firings, and the dispatcher that sends them.

pub mod dispatcher;
pub mod firing;
pub mod matcher;
pub mod rule;
pub mod service;
pub mod template;

pub use dispatcher::{DispatchReport, Dispatcher, spawn_dispatcher};
pub use firing::{FiringStatus, ScheduledFiring, TriggerSnapshot};
pub use matcher::RuleMatcher;
pub use rule::{AutomationRule, Channel, RuleDraft, TriggerKind};
pub use service::RuleService;
