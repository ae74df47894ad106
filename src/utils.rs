//! # Utility Functions
//!
//! Small helpers shared by the CLI and the local run series:
//!
//! - **Formatting**: run lengths for the series banner
//! - **Validation**: command-line parameters, with clear error messages
//! - **System Information**: CPU count for the run banner
//!
//! ```rust
//! use coapbench::utils::*;
//! use std::time::Duration;
//!
//! # fn main() -> anyhow::Result<()> {
//! assert_eq!(format_run_length(Duration::from_millis(1500)), "1.5s");
//! validate_concurrency(100)?;
//! # Ok(())
//! # }
//! ```

use anyhow::Result;
use std::time::Duration;

/// Upper bound on devices per run; each device holds its own UDP socket
/// and thread.
pub const MAX_CONCURRENCY: usize = 20_000;

/// Format the length of one benchmark run.
///
/// Runs are measured in milliseconds at best, so shorter units never show.
///
/// ```rust
/// # use coapbench::utils::format_run_length;
/// # use std::time::Duration;
/// assert_eq!(format_run_length(Duration::from_millis(300)), "300ms");
/// assert_eq!(format_run_length(Duration::from_secs(30)), "30s");
/// assert_eq!(format_run_length(Duration::from_secs(90)), "1m 30s");
/// ```
pub fn format_run_length(duration: Duration) -> String {
    let millis = duration.as_millis();
    match millis {
        0..=999 => format!("{}ms", millis),
        1_000..=59_999 if millis % 1_000 == 0 => format!("{}s", millis / 1_000),
        1_000..=59_999 => format!("{:.1}s", duration.as_secs_f64()),
        _ => {
            let secs = duration.as_secs();
            match (secs / 3_600, secs / 60 % 60, secs % 60) {
                (0, m, 0) => format!("{}m", m),
                (0, m, s) => format!("{}m {}s", m, s),
                (h, m, s) => format!("{}h {}m {}s", h, m, s),
            }
        }
    }
}

/// Validate a TCP port for the control connection.
///
/// ## Returns
/// - `Ok(())`: the port can be used
/// - `Err(anyhow::Error)`: port 0, which would pick a random port the
///   agents cannot know about
pub fn validate_port(port: u16) -> Result<()> {
    if port == 0 {
        anyhow::bail!("Port number cannot be zero");
    }
    Ok(())
}

/// Validate a concurrency level.
///
/// ## Validation Rules
///
/// - **Minimum**: 1 device
/// - **Maximum**: [`MAX_CONCURRENCY`] devices
pub fn validate_concurrency(concurrency: usize) -> Result<()> {
    if concurrency == 0 {
        anyhow::bail!("Concurrency cannot be zero");
    }
    if concurrency > MAX_CONCURRENCY {
        anyhow::bail!(
            "Concurrency {} is too high (maximum {})",
            concurrency,
            MAX_CONCURRENCY
        );
    }
    Ok(())
}

/// Number of logical CPU cores available to the process.
pub fn get_cpu_cores() -> usize {
    num_cpus::get()
}

/// Banner printed before a local run series.
pub fn series_banner(uri: &str, levels: &[usize], duration: Duration) -> String {
    let levels = levels
        .iter()
        .map(usize::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "Run series against {} on {} CPUs: concurrency [{}], {} per run",
        uri,
        get_cpu_cores(),
        levels,
        format_run_length(duration)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_run_length() {
        assert_eq!(format_run_length(Duration::from_millis(0)), "0ms");
        assert_eq!(format_run_length(Duration::from_millis(1500)), "1.5s");
        assert_eq!(format_run_length(Duration::from_secs(120)), "2m");
        assert_eq!(format_run_length(Duration::from_secs(3725)), "1h 2m 5s");
    }

    #[test]
    fn test_validate_port() {
        assert!(validate_port(1).is_ok());
        assert!(validate_port(58888).is_ok());
        assert!(validate_port(0).is_err());
    }

    #[test]
    fn test_validate_concurrency() {
        assert!(validate_concurrency(1).is_ok());
        assert!(validate_concurrency(MAX_CONCURRENCY).is_ok());
        assert!(validate_concurrency(0).is_err());
        assert!(validate_concurrency(MAX_CONCURRENCY + 1).is_err());
    }

    #[test]
    fn test_series_banner() {
        let banner = series_banner("coap://h/x", &[1, 10], Duration::from_secs(30));
        assert!(banner.contains("coap://h/x"));
        assert!(banner.contains("[1, 10]"));
        assert!(banner.contains("30s per run"));
    }
}
