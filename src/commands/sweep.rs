//! Sweep command implementation

use tracing::info;

use crate::config::FollowupConfig;
use crate::engine::QualificationEngine;
use crate::error::Result;
use crate::progress::add_spinner;
use crate::sweep::{SweepReport, Sweeper};

/// One pass, or sweep until interrupted when `watch` is set
pub async fn cmd_sweep(engine: QualificationEngine, config: &FollowupConfig, watch: bool) -> Result<SweepReport> {
    let sweeper = Sweeper::new(engine, config);
    if !watch {
        let spinner = add_spinner("Sweeping pending turns and follow-ups");
        let report = sweeper.run_once().await;
        spinner.finish_and_clear();
        return report;
    }

    tokio::select! {
        _ = sweeper.run_forever() => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted, stopping sweep"),
    }
    Ok(SweepReport::default())
}

pub fn print_sweep_report(report: &SweepReport) {
    println!("✓ Sweep complete");
    println!(
        "  Pending turns: {} found, {} applied, {} skipped, {} failed, {} errors",
        report.pending_found, report.applied, report.skipped, report.failed, report.errors
    );
    println!(
        "  Follow-ups: {} sent, {} failed",
        report.followups_sent, report.followups_failed
    );
}
