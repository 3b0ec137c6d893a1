//! Error display for the CLI.

use colored::Colorize;
use fleet_provisioner::{FleetError, PlatformError};

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {:#}", "Error:".red().bold(), err);

    if let Some(hint) = err.downcast_ref::<FleetError>().and_then(hint_for) {
        eprintln!("\n{}", format!("Hint: {hint}").yellow());
    }

    if let Some(FleetError::TeardownIncomplete { ids, .. }) = err.downcast_ref::<FleetError>() {
        eprintln!("\nInstances left running:");
        for id in ids {
            eprintln!("  {id}");
        }
    }
}

fn hint_for(err: &FleetError) -> Option<&'static str> {
    match err {
        FleetError::Config(_) => {
            Some("Check the flags (or their environment variables) required by this mode.")
        }
        FleetError::NoCapacity { .. } => Some(
            "The provider had no capacity. Try another instance type or the besteffort strategy.",
        ),
        FleetError::ProvisioningExhausted { .. } => {
            Some("Every instance created by this run was terminated. Retry later.")
        }
        FleetError::RegistrationBudgetExhausted { .. } => Some(
            "Runners never registered; every instance was terminated. Check that the image can reach GitHub.",
        ),
        FleetError::TeardownIncomplete { .. } => {
            Some("Some instances could not be stopped and must be terminated by hand.")
        }
        FleetError::Platform(PlatformError::Api { status: 401, .. }) => {
            Some("The GitHub token was rejected. Check GITHUB_TOKEN.")
        }
        FleetError::Platform(PlatformError::Api { status: 403, .. }) => {
            Some("The GitHub token may lack permission to manage self-hosted runners.")
        }
        FleetError::Platform(PlatformError::Network(_)) => {
            Some("Check your network connection and the GitHub API endpoint.")
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_provisioner::ConfigError;

    #[test]
    fn test_hints() {
        let config = FleetError::Config(ConfigError::InvalidMode("restart".into()));
        assert!(hint_for(&config).is_some());

        let forbidden = FleetError::Platform(PlatformError::Api {
            status: 403,
            message: "Resource not accessible by integration".into(),
        });
        assert!(hint_for(&forbidden).unwrap().contains("permission"));

        let not_found = FleetError::Platform(PlatformError::Api {
            status: 404,
            message: "Not Found".into(),
        });
        assert!(hint_for(&not_found).is_none());
    }
}
