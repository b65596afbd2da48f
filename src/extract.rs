//! Result extraction from raw interpreter output
//!
//! The session script prints its result object as the last non-empty line of
//! stdout. Anything before that line is diagnostic noise. When that line is
//! missing or is not a valid result object, a failure result is synthesized
//! from the raw streams so callers always get a well-formed outcome.

use crate::models::ExecutionResult;
use crate::runner::ProcessOutput;

/// Generic error used when the script printed nothing usable and stderr is empty
const NO_STRUCTURED_OUTPUT: &str = "No structured output from script";

/// Convert captured process output into an [`ExecutionResult`]
///
/// Never fails. A timed-out run is always a failure, even if a payload line
/// was printed before the kill.
pub fn extract(output: &ProcessOutput) -> ExecutionResult {
    if output.timed_out {
        return fallback(
            output,
            format!(
                "Script timed out after {}ms and was killed",
                output.elapsed.as_millis()
            ),
        );
    }

    match payload_line(&output.stdout) {
        Some(line) => match serde_json::from_str::<ExecutionResult>(line) {
            Ok(result) => result,
            Err(e) => fallback(output, format!("Parse error: {e}")),
        },
        None => {
            let stderr = output.stderr.trim();
            let error = if stderr.is_empty() {
                NO_STRUCTURED_OUTPUT.to_owned()
            } else {
                stderr.to_owned()
            };
            fallback(output, error)
        }
    }
}

/// Last non-empty stdout line, if it looks like a JSON object
fn payload_line(stdout: &str) -> Option<&str> {
    stdout
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .filter(|line| line.starts_with('{') && line.ends_with('}'))
}

fn fallback(output: &ProcessOutput, error: String) -> ExecutionResult {
    let mut logs: Vec<String> = [&output.stdout, &output.stderr]
        .into_iter()
        .filter(|s| !s.trim().is_empty())
        .cloned()
        .collect();
    logs.push(match output.exit_code {
        Some(code) => format!("Interpreter exited with code {code}"),
        None => "Interpreter terminated without an exit code".to_owned(),
    });

    ExecutionResult {
        success: false,
        data: None,
        error: Some(error),
        logs,
        raw_output: Some(output.stdout.clone()),
    }
}
