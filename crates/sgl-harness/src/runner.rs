use nvme_sgl::{DmaAllocator, IoDevice};

use crate::report::{DeviceError, DeviceReport, FailureKind, ShapeReport, ShapeStatus};
use crate::shapes::{RequestShape, SHAPES};
use crate::verify::{writev_readv, ShapeOutcome, VerifyError, VerifyOptions};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub verify: VerifyOptions,
    /// Shapes to run, in order.
    pub shapes: Vec<RequestShape>,
    /// Number of passes over `shapes`.
    pub repeat: u32,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            verify: VerifyOptions::default(),
            shapes: SHAPES.to_vec(),
            repeat: 1,
        }
    }
}

/// Runs every selected shape against one attached device.
///
/// A failed shape is recorded and the next one still runs; only a missing namespace ends the
/// device early, since no later shape could run either.
pub fn run_device(
    device: &mut dyn IoDevice,
    alloc: &mut dyn DmaAllocator,
    opts: &RunOptions,
) -> DeviceReport {
    let mut report = DeviceReport::new(device.name());
    let span = tracing::info_span!("device", name = %report.device);
    let _enter = span.enter();

    for iteration in 0..opts.repeat {
        for shape in &opts.shapes {
            let status = match writev_readv(device, alloc, shape, &opts.verify) {
                Ok(ShapeOutcome::Passed) => {
                    tracing::info!(shape = shape.id, name = shape.name, "writev_readv passed");
                    ShapeStatus::Passed
                }
                Ok(ShapeOutcome::Skipped(reason)) => {
                    tracing::info!(shape = shape.id, name = shape.name, %reason, "skipped");
                    ShapeStatus::Skipped { reason }
                }
                Err(err @ VerifyError::NamespaceUnavailable) => {
                    tracing::error!("{err}");
                    report.error = Some(DeviceError {
                        kind: FailureKind::NamespaceUnavailable,
                        message: err.to_string(),
                    });
                    return report;
                }
                Err(err) => {
                    tracing::error!(shape = shape.id, name = shape.name, "{err}");
                    ShapeStatus::Failed {
                        kind: FailureKind::from(&err),
                        message: err.to_string(),
                    }
                }
            };
            report.shapes.push(ShapeReport {
                shape: shape.id,
                name: shape.name,
                iteration,
                status,
            });
        }
    }

    if report.failed() {
        tracing::warn!("failed sgl tests");
    }
    report
}
