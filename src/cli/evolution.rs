use super::ui;
use crate::core::MarketData;
use crate::core::evolution::{EvolutionResult, EvolutionSource};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use comfy_table::Cell;
use rust_decimal::Decimal;

impl EvolutionResult {
    pub fn display_as_table(&self, title: &str) -> String {
        if self.is_insufficient() {
            return format!(
                "\n{}\n{}",
                ui::style_text(title, ui::StyleType::Title),
                ui::style_text("Not enough data to build an evolution for this range.", ui::StyleType::Warning)
            );
        }

        let mut table = ui::new_styled_table();
        table.set_header(vec![ui::header_cell("Date"), ui::header_cell("Value (BRL)")]);
        for point in &self.points {
            table.add_row(vec![
                Cell::new(point.date.format("%Y-%m-%d")),
                ui::money_cell(point.value),
            ]);
        }

        let source = match self.source {
            EvolutionSource::Live => "live prices",
            EvolutionSource::Snapshot => "stored snapshots (upstream unavailable)",
            EvolutionSource::Synthetic => "synthetic interpolation",
            EvolutionSource::InsufficientData => "no data",
        };
        let source_style = if self.degraded {
            ui::StyleType::Warning
        } else {
            ui::StyleType::Subtle
        };
        format!(
            "\n{}\n{table}\n{}",
            ui::style_text(title, ui::StyleType::Title),
            ui::style_text(&format!("Source: {source}"), source_style)
        )
    }
}

/// Prints the evolution of `owner`. With `synthetic` set, prints the
/// interpolated curve between the two values instead of asking upstream.
pub async fn run(
    market: &MarketData,
    owner: &str,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    synthetic: Option<(Decimal, Decimal)>,
) -> Result<()> {
    let end = end.unwrap_or_else(|| market.calendar().local_date(market.clock().now()));
    let start = start.unwrap_or(end - chrono::Duration::days(30));

    let result = match synthetic {
        Some((start_value, end_value)) => market
            .synthetic_evolution(start, end, start_value, end_value)
            .context("Failed to build synthetic evolution")?,
        None => market
            .get_evolution(owner, start, end)
            .await
            .with_context(|| format!("Failed to compute evolution for {owner}"))?,
    };

    let title = format!("Evolution: {owner} ({start} to {end})");
    println!("{}", result.display_as_table(&title));
    Ok(())
}
