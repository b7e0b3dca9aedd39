use std::fmt;

/// Label carried by every resource that belongs to an application.
pub const APPLICATION_LABEL: &str = "radapp.io/application";

/// Label naming the container a pod was rendered from; used for status
/// messages in preference to the pod-name heuristic.
pub const RESOURCE_LABEL: &str = "radapp.io/resource";

/// Standard labels identifying the dashboard deployment.
pub const NAME_LABEL: &str = "app.kubernetes.io/name";
pub const PART_OF_LABEL: &str = "app.kubernetes.io/part-of";

/// Annotation partitioning replica sets into current vs outdated.
pub const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

/// Selects the deployments (and their pods) an [`ApplicationWatcher`] covers.
///
/// Two selectors are equal iff their canonical label-selector serialization
/// is equal.
///
/// [`ApplicationWatcher`]: crate::portforward::ApplicationWatcher
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplicationSelector {
    /// Everything labelled `radapp.io/application=<name>`.
    Application(String),
    /// The well-known dashboard deployment in the system namespace.
    Dashboard,
}

impl ApplicationSelector {
    pub fn application(name: impl Into<String>) -> Self {
        Self::Application(name.into())
    }

    pub fn to_label_selector(&self) -> String {
        match self {
            Self::Application(name) => format!("{APPLICATION_LABEL}={name}"),
            Self::Dashboard => format!("{NAME_LABEL}=dashboard,{PART_OF_LABEL}=radius"),
        }
    }
}

impl fmt::Display for ApplicationSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_label_selector())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_application_selector() {
        let selector = ApplicationSelector::application("demo");
        assert_eq!(selector.to_label_selector(), "radapp.io/application=demo");
    }

    #[test]
    fn test_dashboard_selector() {
        assert_eq!(
            ApplicationSelector::Dashboard.to_label_selector(),
            "app.kubernetes.io/name=dashboard,app.kubernetes.io/part-of=radius"
        );
    }

    #[test]
    fn test_selector_identity_is_serialized_form() {
        assert_eq!(
            ApplicationSelector::application("demo"),
            ApplicationSelector::Application("demo".to_string())
        );
        assert_ne!(
            ApplicationSelector::application("demo"),
            ApplicationSelector::Dashboard
        );
    }
}
