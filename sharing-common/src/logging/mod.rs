// Logging utilities for the certificate stack
//
// Component-scoped loggers on top of the `log` facade. Every line carries the
// local device id plus the component chain, and optionally the operation the
// component is working on (a scheduler name, a connection endpoint).

use log::{debug, error, info, warn, LevelFilter};
use std::fmt::{self, Arguments, Display, Formatter};
use std::sync::Once;

/// Predefined components for logging categorization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Certificates,
    Storage,
    Scheduler,
    Manager,
    Verification,
    Rpc,
    System,
    Custom(&'static str),
}

impl Component {
    /// Get the string representation of the component
    pub fn as_str(&self) -> &str {
        match self {
            Component::Certificates => "Certificates",
            Component::Storage => "Storage",
            Component::Scheduler => "Scheduler",
            Component::Manager => "Manager",
            Component::Verification => "Verification",
            Component::Rpc => "Rpc",
            Component::System => "System",
            Component::Custom(name) => name,
        }
    }
}

// Display helpers so the *_args variants never allocate a prefix String
struct ComponentPrefixDisplay {
    parent: Option<Component>,
    component: Component,
}

impl Display for ComponentPrefixDisplay {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.parent {
            Some(parent) if parent != Component::System => {
                write!(f, "{}.{}", parent.as_str(), self.component.as_str())
            }
            _ => write!(f, "{}", self.component.as_str()),
        }
    }
}

struct MaybeOperationDisplay<'a>(Option<&'a str>);

impl Display for MaybeOperationDisplay<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(op) => write!(f, "|op={op}"),
            None => Ok(()),
        }
    }
}

/// A component-specific logger tagged with the local device id
#[derive(Clone, Debug)]
pub struct Logger {
    component: Component,
    device_id: String,
    parent_component: Option<Component>,
    operation: Option<String>,
}

impl Logger {
    /// Create a root logger for a component and device id
    pub fn new_root(component: Component, device_id: &str) -> Self {
        Self {
            component,
            device_id: device_id.to_string(),
            parent_component: None,
            operation: None,
        }
    }

    /// Create a child logger with the same device id but a different component
    pub fn with_component(&self, component: Component) -> Self {
        Self {
            component,
            device_id: self.device_id.clone(),
            parent_component: Some(self.component),
            operation: self.operation.clone(),
        }
    }

    /// Create a logger tagged with the operation being performed
    pub fn with_operation(&self, operation: impl Into<String>) -> Self {
        Self {
            component: self.component,
            device_id: self.device_id.clone(),
            parent_component: self.parent_component,
            operation: Some(operation.into()),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn component(&self) -> Component {
        self.component
    }

    pub fn operation(&self) -> Option<&str> {
        self.operation.as_deref()
    }

    fn prefix(&self) -> ComponentPrefixDisplay {
        ComponentPrefixDisplay {
            parent: self.parent_component,
            component: self.component,
        }
    }

    /// Log a debug message
    pub fn debug(&self, message: impl Into<String>) {
        if log::log_enabled!(log::Level::Debug) {
            self.debug_args(format_args!("{}", message.into()));
        }
    }

    /// Log a debug message using fmt::Arguments (avoids allocating message String)
    pub fn debug_args(&self, args: Arguments) {
        if log::log_enabled!(log::Level::Debug) {
            debug!(
                "[{}][{}{}] {}",
                self.device_id,
                self.prefix(),
                MaybeOperationDisplay(self.operation()),
                args
            );
        }
    }

    /// Log an info message
    pub fn info(&self, message: impl Into<String>) {
        if log::log_enabled!(log::Level::Info) {
            self.info_args(format_args!("{}", message.into()));
        }
    }

    pub fn info_args(&self, args: Arguments) {
        if log::log_enabled!(log::Level::Info) {
            info!(
                "[{}][{}{}] {}",
                self.device_id,
                self.prefix(),
                MaybeOperationDisplay(self.operation()),
                args
            );
        }
    }

    /// Log a warning message
    pub fn warn(&self, message: impl Into<String>) {
        if log::log_enabled!(log::Level::Warn) {
            self.warn_args(format_args!("{}", message.into()));
        }
    }

    pub fn warn_args(&self, args: Arguments) {
        if log::log_enabled!(log::Level::Warn) {
            warn!(
                "[{}][{}{}] {}",
                self.device_id,
                self.prefix(),
                MaybeOperationDisplay(self.operation()),
                args
            );
        }
    }

    /// Log an error message
    pub fn error(&self, message: impl Into<String>) {
        if log::log_enabled!(log::Level::Error) {
            self.error_args(format_args!("{}", message.into()));
        }
    }

    pub fn error_args(&self, args: Arguments) {
        if log::log_enabled!(log::Level::Error) {
            error!(
                "[{}][{}{}] {}",
                self.device_id,
                self.prefix(),
                MaybeOperationDisplay(self.operation()),
                args
            );
        }
    }
}

static TEST_LOGGING: Once = Once::new();

/// Install env_logger once for test binaries. Honors RUST_LOG, defaults to warn.
pub fn init_test_logging() {
    TEST_LOGGING.call_once(|| {
        let _ = env_logger::builder()
            .is_test(true)
            .filter_level(LevelFilter::Warn)
            .parse_default_env()
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_logger_keeps_device_id_and_parent() {
        let root = Logger::new_root(Component::Manager, "device-1");
        let child = root.with_component(Component::Storage).with_operation("init");

        assert_eq!(child.device_id(), "device-1");
        assert_eq!(child.component(), Component::Storage);
        assert_eq!(child.operation(), Some("init"));
        assert_eq!(child.prefix().to_string(), "Manager.Storage");
    }

    #[test]
    fn system_parent_is_not_repeated_in_prefix() {
        let root = Logger::new_root(Component::System, "device-1");
        let child = root.with_component(Component::Verification);
        assert_eq!(child.prefix().to_string(), "Verification");
        assert_eq!(
            MaybeOperationDisplay(Some("endpoint-A")).to_string(),
            "|op=endpoint-A"
        );
    }
}
