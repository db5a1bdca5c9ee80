use std::fmt::Write as _;

use serde::Serialize;

use crate::verify::{SkipReason, VerifyError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Setup,
    Submission,
    Completion,
    Timeout,
    DataIntegrity,
    NamespaceUnavailable,
    Attach,
}

impl From<&VerifyError> for FailureKind {
    fn from(err: &VerifyError) -> Self {
        match err {
            VerifyError::NamespaceUnavailable => FailureKind::NamespaceUnavailable,
            VerifyError::Setup(_) => FailureKind::Setup,
            VerifyError::Submit { .. } => FailureKind::Submission,
            VerifyError::Completion { .. } => FailureKind::Completion,
            VerifyError::Timeout { .. } => FailureKind::Timeout,
            VerifyError::DataMismatch { .. } => FailureKind::DataIntegrity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ShapeStatus {
    Passed,
    Skipped { reason: SkipReason },
    Failed { kind: FailureKind, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShapeReport {
    pub shape: u8,
    pub name: &'static str,
    pub iteration: u32,
    #[serde(flatten)]
    pub status: ShapeStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceReport {
    pub device: String,
    /// Set when the device could not be tested at all, or testing stopped early.
    pub error: Option<DeviceError>,
    pub shapes: Vec<ShapeReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceError {
    pub kind: FailureKind,
    pub message: String,
}

impl DeviceReport {
    pub fn new(device: impl Into<String>) -> Self {
        DeviceReport {
            device: device.into(),
            error: None,
            shapes: Vec::new(),
        }
    }

    pub fn attach_failed(device: impl Into<String>, err: &dyn std::error::Error) -> Self {
        DeviceReport {
            error: Some(DeviceError {
                kind: FailureKind::Attach,
                message: err.to_string(),
            }),
            ..DeviceReport::new(device)
        }
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
            || self
                .shapes
                .iter()
                .any(|s| matches!(s.status, ShapeStatus::Failed { .. }))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub passed: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub devices: Vec<DeviceReport>,
    pub totals: Totals,
}

impl RunSummary {
    pub fn push(&mut self, report: DeviceReport) {
        for shape in &report.shapes {
            match shape.status {
                ShapeStatus::Passed => self.totals.passed += 1,
                ShapeStatus::Skipped { .. } => self.totals.skipped += 1,
                ShapeStatus::Failed { .. } => self.totals.failed += 1,
            }
        }
        self.devices.push(report);
    }

    pub fn passed(&self) -> bool {
        !self.devices.iter().any(DeviceReport::failed)
    }

    /// Process exit status: 0 only when no device failed.
    pub fn exit_code(&self) -> u8 {
        if self.passed() {
            0
        } else {
            1
        }
    }

    /// One line per shape run plus a per-device verdict.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for dev in &self.devices {
            for s in &dev.shapes {
                let _ = match &s.status {
                    ShapeStatus::Passed => writeln!(
                        out,
                        "{} shape {} ({}) Test Passed",
                        dev.device, s.shape, s.name
                    ),
                    ShapeStatus::Skipped { reason } => writeln!(
                        out,
                        "{} shape {} ({}) skipped: {reason}",
                        dev.device, s.shape, s.name
                    ),
                    ShapeStatus::Failed { message, .. } => writeln!(
                        out,
                        "{} shape {} ({}) {message}",
                        dev.device, s.shape, s.name
                    ),
                };
            }
            if let Some(err) = &dev.error {
                let _ = writeln!(out, "{}: {}", dev.device, err.message);
            }
            let verdict = if dev.failed() {
                "failed sgl tests"
            } else {
                "all sgl tests passed"
            };
            let _ = writeln!(out, "{}: {verdict}", dev.device);
        }
        let t = self.totals;
        let _ = writeln!(
            out,
            "{} passed, {} skipped, {} failed",
            t.passed, t.skipped, t.failed
        );
        out
    }
}
