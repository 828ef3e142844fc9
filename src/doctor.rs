// =============================================================================
// Doctor — preflight diagnostics
// =============================================================================
//
// Runs the startup-critical checks (environment, config file, CA bundle,
// instrument resolution) and reports them as OK/FAIL rows. Any failed row
// makes the run fatal (exit code 1).

use std::path::Path;
use std::sync::Arc;

use tracing::warn;

use crate::config::{
    configure_root_certificates, load_app_config, missing_required_env, process_env_loader,
    ROOT_CERT_ENV,
};
use crate::market_data::client::{MarketDataApi, MarketDataClient};

pub const DEFAULT_DOCTOR_SYMBOLS: &[&str] = &["SBER"];

#[derive(Debug, Clone)]
pub struct DoctorCheck {
    pub name: &'static str,
    pub ok: bool,
    pub message: String,
}

impl DoctorCheck {
    fn ok(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            ok: true,
            message: message.into(),
        }
    }

    fn fail(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            ok: false,
            message: message.into(),
        }
    }
}

/// Run every preflight check; returns the report and whether any check
/// failed. Symbols default to [`DEFAULT_DOCTOR_SYMBOLS`] when empty.
pub async fn build_doctor_report(
    symbols: &[String],
    config_path: Option<&Path>,
) -> (Vec<DoctorCheck>, bool) {
    let mut report = Vec::new();
    let mut fatal = false;

    let mut loader = process_env_loader();
    let settings = match loader.load() {
        Ok(settings) => Some(settings),
        Err(error) => {
            report.push(DoctorCheck::fail("env", error.to_string()));
            fatal = true;
            None
        }
    };

    if let Some(settings) = &settings {
        let missing = missing_required_env(settings);
        if missing.is_empty() {
            report.push(DoctorCheck::ok("env", "Required environment variables set"));
        } else {
            report.push(DoctorCheck::fail(
                "env",
                format!("Missing required: {}", missing.join(", ")),
            ));
            fatal = true;
        }
    }

    match load_app_config(config_path) {
        Ok(_) => report.push(DoctorCheck::ok("config", "Config loaded")),
        Err(error) => {
            report.push(DoctorCheck::fail("config", error.to_string()));
            fatal = true;
        }
    }

    if let Some(settings) = &settings {
        match configure_root_certificates(settings) {
            Ok(Some(path)) => report.push(DoctorCheck::ok(
                "ca_bundle",
                format!("Using {}={}", ROOT_CERT_ENV, path.display()),
            )),
            Ok(None) => report.push(DoctorCheck::ok(
                "ca_bundle",
                "Using system/available CA bundle",
            )),
            Err(error) => {
                report.push(DoctorCheck::fail("ca_bundle", error.to_string()));
                fatal = true;
            }
        }
    }

    if !fatal {
        if let Some(settings) = &settings {
            let symbols: Vec<String> = if symbols.is_empty() {
                DEFAULT_DOCTOR_SYMBOLS
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            } else {
                symbols.to_vec()
            };
            let client: Arc<dyn MarketDataApi> = Arc::new(MarketDataClient::new(
                settings.token.clone().unwrap_or_default(),
                settings.instrument_status,
                settings.stream_idle_sleep_seconds,
            ));
            match client.resolve_instruments(&symbols).await {
                Ok((resolved, failures)) if !resolved.is_empty() => {
                    report.push(DoctorCheck::ok(
                        "api",
                        format!("Resolved {} instrument(s)", resolved.len()),
                    ));
                    if !failures.is_empty() {
                        warn!(symbols = ?failures, "instrument_resolve_failed");
                    }
                }
                Ok(_) => {
                    report.push(DoctorCheck::fail("api", "No instruments resolved"));
                    fatal = true;
                }
                Err(error) => {
                    report.push(DoctorCheck::fail(
                        "api",
                        format!("Resolve request failed: {error}"),
                    ));
                    fatal = true;
                }
            }
        }
    }

    (report, fatal)
}

/// Print the report in the tab-separated operator format.
pub fn print_report(report: &[DoctorCheck]) {
    for check in report {
        let status = if check.ok { "OK" } else { "FAIL" };
        println!("{status}\t{}\t{}", check.name, check.message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_constructors() {
        let ok = DoctorCheck::ok("env", "fine");
        assert!(ok.ok);
        assert_eq!(ok.name, "env");
        let fail = DoctorCheck::fail("config", "broken");
        assert!(!fail.ok);
        assert_eq!(fail.message, "broken");
    }
}
