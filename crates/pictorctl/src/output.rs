use std::io;

use anyhow::Result;
use prettytable::format::consts::FORMAT_CLEAN;
use prettytable::{Table, cell, row};

use crate::load::LoadReport;

pub fn print_table(reports: &[LoadReport]) {
    let mut table = Table::new();
    table.set_format(*FORMAT_CLEAN);
    table.set_titles(row![b => "Round", "URI", "Outcome", "Source", "Size", "Type", "Time"]);

    for report in reports {
        let source = match (&report.provenance, &report.cause) {
            (Some(provenance), _) => provenance.to_string(),
            (None, Some(cause)) => cause.clone(),
            (None, None) => String::new(),
        };
        let (size, mime_type) = match &report.image {
            Some(image) => (
                format!("{}x{}", image.width, image.height),
                match image.animated {
                    true => format!("{} (animated)", image.mime_type),
                    false => image.mime_type.clone(),
                },
            ),
            None => (String::new(), String::new()),
        };

        table.add_row(row![
            report.round,
            report.uri,
            report.state,
            source,
            size,
            mime_type,
            format!("{}ms", report.duration.as_millis()),
        ]);
    }

    table.printstd();
}

pub fn print_json(reports: &[LoadReport]) -> Result<()> {
    serde_json::to_writer_pretty(io::stdout().lock(), reports)?;
    println!();
    Ok(())
}
