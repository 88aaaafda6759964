//! Report rendering: text summary table or JSON for scripting

use spine_scheduler::ScheduleReport;

/// Print a schedule report in the requested format
pub fn print_report(report: &ScheduleReport, json: bool) {
    if json {
        match serde_json::to_string_pretty(&report.to_json()) {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("failed to render JSON report: {e}"),
        }
    } else {
        print!("{}", report.render_table());
    }
}
