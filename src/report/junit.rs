//! JUnit XML run report.
//!
//! Renders the final [`RunState`] as JUnit XML so CI systems can display a
//! run. Each recorded result becomes one test case: the class name is the
//! device and the name is the log key.
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites tests="3" failures="1" errors="1" time="42.180">
//!   <testsuite name="fleetrun" tests="3" failures="1" errors="1" skipped="0" time="42.180" timestamp="2025-07-21 16:14:04">
//!     <testcase classname="emulator-5554" name="emulator-5554_login_test" time="12.004">
//!       <system-out>[[ATTACHMENT|runs/1753085644830_logs/emulator-5554_login_test/log.html]]</system-out>
//!     </testcase>
//!     <testcase classname="emulator-5554" name="emulator-5554_pay_test" time="20.311">
//!       <failure message="exit status 1" type="ExitStatus">airtest run pay_test.py ...</failure>
//!     </testcase>
//!     <testcase classname="R58M" name="R58M_login_test" time="9.865">
//!       <error message="timed out" type="Timeout">airtest run login_test.py ...</error>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```

use std::path::PathBuf;

use async_trait::async_trait;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::{Reporter, SummaryRecord};
use crate::orchestrator::scheduler::Assignment;
use crate::state::{ReportRecord, RunState};
use crate::task::Task;
use crate::tool::{STATUS_INVOCATION_ERROR, STATUS_TIMED_OUT};

/// Where the XML file goes.
enum Target {
    File(PathBuf),
    /// `{dir}/{RunState::report_file}`
    RunDir(PathBuf),
}

/// Reporter that writes a JUnit XML file when the run completes.
///
/// Parent directories are created automatically.
///
/// # Example
///
/// ```
/// use fleetrun::report::JUnitReporter;
///
/// let reporter = JUnitReporter::new("ci/junit.xml".into())
///     .with_testsuite_name("smoke");
/// ```
pub struct JUnitReporter {
    target: Target,
    testsuite_name: String,
}

impl JUnitReporter {
    /// Writes to `output_path`.
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            target: Target::File(output_path),
            testsuite_name: "fleetrun".to_string(),
        }
    }

    /// Writes next to the state file, as `{run_id}_junit.xml` in `output_dir`.
    pub fn in_output_dir(output_dir: PathBuf) -> Self {
        Self {
            target: Target::RunDir(output_dir),
            testsuite_name: "fleetrun".to_string(),
        }
    }

    fn output_path(&self, state: &RunState) -> PathBuf {
        match &self.target {
            Target::File(path) => path.clone(),
            Target::RunDir(dir) => dir.join(&state.report_file),
        }
    }

    /// Sets the test suite name in the XML output.
    pub fn with_testsuite_name(mut self, name: impl Into<String>) -> Self {
        self.testsuite_name = name.into();
        self
    }

    fn generate_xml(&self, summary: &SummaryRecord, state: &RunState) -> anyhow::Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let errors = state
            .tests
            .values()
            .filter(|r| Outcome::of(r).is_error())
            .count();
        let failures = summary.failed() - errors;
        let tests = summary.count.to_string();
        let failures = failures.to_string();
        let errors = errors.to_string();
        let time = format!("{:.3}", summary.elapsed);

        let mut testsuites = BytesStart::new("testsuites");
        testsuites.push_attribute(("tests", tests.as_str()));
        testsuites.push_attribute(("failures", failures.as_str()));
        testsuites.push_attribute(("errors", errors.as_str()));
        testsuites.push_attribute(("time", time.as_str()));
        writer.write_event(Event::Start(testsuites))?;

        let mut testsuite = BytesStart::new("testsuite");
        testsuite.push_attribute(("name", self.testsuite_name.as_str()));
        testsuite.push_attribute(("tests", tests.as_str()));
        testsuite.push_attribute(("failures", failures.as_str()));
        testsuite.push_attribute(("errors", errors.as_str()));
        testsuite.push_attribute(("skipped", "0"));
        testsuite.push_attribute(("time", time.as_str()));
        testsuite.push_attribute(("timestamp", summary.start.as_str()));
        writer.write_event(Event::Start(testsuite))?;

        for (log_key, record) in &state.tests {
            write_testcase(&mut writer, log_key, record)?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

        Ok(String::from_utf8(writer.into_inner())?)
    }
}

enum Outcome {
    Passed,
    Failed(i32),
    TimedOut,
    NotRun,
}

impl Outcome {
    fn of(record: &ReportRecord) -> Self {
        match record.status {
            0 => Self::Passed,
            STATUS_TIMED_OUT => Self::TimedOut,
            STATUS_INVOCATION_ERROR => Self::NotRun,
            code => Self::Failed(code),
        }
    }

    fn is_error(&self) -> bool {
        matches!(self, Self::TimedOut | Self::NotRun)
    }
}

fn write_testcase<W: std::io::Write>(
    writer: &mut Writer<W>,
    log_key: &str,
    record: &ReportRecord,
) -> anyhow::Result<()> {
    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", record.device.as_str()));
    testcase.push_attribute(("name", log_key));
    testcase.push_attribute((
        "time",
        format!("{:.3}", record.spend_time.unwrap_or_default()).as_str(),
    ));

    let (element, message, kind) = match Outcome::of(record) {
        Outcome::Passed if record.path.is_empty() => {
            writer.write_event(Event::Empty(testcase))?;
            return Ok(());
        }
        Outcome::Passed => {
            writer.write_event(Event::Start(testcase))?;
            write_attachment(writer, &record.path)?;
            writer.write_event(Event::End(BytesEnd::new("testcase")))?;
            return Ok(());
        }
        Outcome::Failed(code) => ("failure", format!("exit status {}", code), "ExitStatus"),
        Outcome::TimedOut => ("error", "timed out".to_string(), "Timeout"),
        Outcome::NotRun => ("error", "no log produced".to_string(), "InvocationError"),
    };

    writer.write_event(Event::Start(testcase))?;

    let mut detail = BytesStart::new(element);
    detail.push_attribute(("message", message.as_str()));
    detail.push_attribute(("type", kind));
    writer.write_event(Event::Start(detail))?;
    writer.write_event(Event::Text(BytesText::new(&sanitize(&record.run_command))))?;
    writer.write_event(Event::End(BytesEnd::new(element)))?;

    if !record.path.is_empty() {
        write_attachment(writer, &record.path)?;
    }

    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    Ok(())
}

fn write_attachment<W: std::io::Write>(writer: &mut Writer<W>, path: &str) -> anyhow::Result<()> {
    writer.write_event(Event::Start(BytesStart::new("system-out")))?;
    let text = format!("[[ATTACHMENT|{}]]", sanitize(path));
    writer.write_event(Event::Text(BytesText::new(&text)))?;
    writer.write_event(Event::End(BytesEnd::new("system-out")))?;
    Ok(())
}

/// Drops characters that are not allowed in XML 1.0.
fn sanitize(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}'))
        .collect()
}

#[async_trait]
impl Reporter for JUnitReporter {
    async fn on_plan_complete(&self, _assignment: &Assignment) {}

    async fn on_task_start(&self, _task: &Task) {}

    async fn on_task_complete(&self, _task: &Task) {}

    async fn on_run_complete(&self, summary: &SummaryRecord, state: &RunState) {
        let output_path = self.output_path(state);
        match self.generate_xml(summary, state) {
            Ok(xml) => {
                if let Some(parent) = output_path.parent()
                    && !parent.as_os_str().is_empty()
                    && !parent.exists()
                    && let Err(e) = std::fs::create_dir_all(parent)
                {
                    tracing::error!("Failed to create output directory: {}", e);
                    return;
                }

                if let Err(e) = std::fs::write(&output_path, xml) {
                    tracing::error!("Failed to write JUnit XML: {}", e);
                } else {
                    tracing::info!("JUnit XML written to: {}", output_path.display());
                }
            }
            Err(e) => {
                tracing::error!("Failed to generate JUnit XML: {}", e);
            }
        }
    }
}
