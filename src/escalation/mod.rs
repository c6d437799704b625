//! Lead escalation to an operator chat and an external task system.

pub mod escalator;
pub mod notify;
pub mod rules;
pub mod tasks;

pub use escalator::{ChannelOutcome, EscalationOutcome, EscalationReport, Escalator, alert};
pub use notify::{NoopNotifier, Notifier, TelegramNotifier};
pub use rules::{EscalationRule, Priority, format_message, rule_for};
pub use tasks::{HttpTaskSink, NoopTaskSink, TaskRequest, TaskSink};
