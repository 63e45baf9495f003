use super::ui;
use crate::core::MarketData;
use crate::core::valuation::{PortfolioValuation, PriceSource};
use anyhow::{Context, Result};
use comfy_table::Cell;

impl PortfolioValuation {
    pub fn display_as_table(&self) -> String {
        let mut table = ui::new_styled_table();

        table.set_header(vec![
            ui::header_cell("Ticker"),
            ui::header_cell("Quantity"),
            ui::header_cell("Avg Cost"),
            ui::header_cell("Price"),
            ui::header_cell("Invested (BRL)"),
            ui::header_cell("Current (BRL)"),
            ui::header_cell("Return"),
        ]);

        for position in &self.positions {
            let price = match position.price_source {
                PriceSource::Cache => format!("{:.2}", position.current_price.round_dp(2)),
                PriceSource::Live => format!("{:.2} (live)", position.current_price.round_dp(2)),
                PriceSource::AverageCost => {
                    ui::style_text(&format!("{:.2} (cost)", position.current_price.round_dp(2)), ui::StyleType::Subtle)
                }
            };
            table.add_row(vec![
                Cell::new(&position.ticker),
                Cell::new(position.quantity.normalize().to_string()),
                ui::money_cell(position.average_cost),
                Cell::new(price),
                ui::money_cell(position.invested_value),
                ui::money_cell(position.current_value),
                ui::change_cell(position.return_pct),
            ]);
        }

        let totals = &self.totals;
        let total_style = if totals.total_return >= rust_decimal::Decimal::ZERO {
            ui::StyleType::TotalValue
        } else {
            ui::StyleType::Error
        };
        let best = totals
            .best_asset
            .as_ref()
            .map_or("N/A".to_string(), |a| format!("{} ({:.2}%)", a.ticker, a.return_pct.round_dp(2)));
        let worst = totals
            .worst_asset
            .as_ref()
            .map_or("N/A".to_string(), |a| format!("{} ({:.2}%)", a.ticker, a.return_pct.round_dp(2)));

        format!(
            "\n{}\n{table}\n{} {:.2}\n{} {:.2}\n{} {}\n{} {best}\n{} {worst}\n{}",
            ui::style_text(&format!("Portfolio: {}", self.owner), ui::StyleType::Title),
            ui::style_text("Invested:", ui::StyleType::TotalLabel),
            totals.invested.round_dp(2),
            ui::style_text("Current:", ui::StyleType::TotalLabel),
            totals.current.round_dp(2),
            ui::style_text("Return:", ui::StyleType::TotalLabel),
            ui::style_text(
                &format!("{:.2} ({:.2}%)", totals.total_return.round_dp(2), totals.return_pct.round_dp(2)),
                total_style
            ),
            ui::style_text("Best:", ui::StyleType::TotalLabel),
            ui::style_text("Worst:", ui::StyleType::TotalLabel),
            ui::style_text(
                &format!("USD/BRL {} at {}", totals.exchange_rate, totals.updated_at.format("%Y-%m-%d %H:%M UTC")),
                ui::StyleType::Subtle
            ),
        )
    }
}

/// Prints the valuation of each owner in `owners`.
pub async fn run(market: &MarketData, owners: &[String]) -> Result<()> {
    let count = owners.len();
    for (i, owner) in owners.iter().enumerate() {
        let valuation = market
            .get_portfolio_valuation(owner)
            .await
            .with_context(|| format!("Failed to value portfolio of {owner}"))?;
        println!("{}", valuation.display_as_table());
        if i + 1 < count {
            ui::print_separator();
        }
    }
    Ok(())
}
