use super::ui;
use crate::core::MarketData;
use anyhow::Result;
use comfy_table::Cell;

/// Prints the exchange rate and the health of the cache.
pub async fn run(market: &MarketData) -> Result<()> {
    let rate = market.get_exchange_rate().await;
    let status = market.status()?;

    let mut table = ui::new_styled_table();
    table.set_header(vec![ui::header_cell("Item"), ui::header_cell("Value")]);

    let rate_updated = status
        .exchange_rate
        .updated_at
        .map_or("default rate".to_string(), |at| at.format("%Y-%m-%d %H:%M UTC").to_string());
    table.add_row(vec![Cell::new("USD/BRL"), Cell::new(format!("{rate} ({rate_updated})"))]);
    table.add_row(vec![
        Cell::new("Market"),
        Cell::new(if status.market_open {
            "open".to_string()
        } else {
            format!("closed, opens {}", status.next_open.format("%Y-%m-%d %H:%M UTC"))
        }),
    ]);
    let pause = match status.paused_until {
        Some(until) if until > market.clock().now() => {
            ui::style_text(&format!("paused until {}", until.format("%Y-%m-%d %H:%M UTC")), ui::StyleType::Warning)
        }
        _ => "available".to_string(),
    };
    table.add_row(vec![Cell::new("Upstream"), Cell::new(pause)]);
    table.add_row(vec![
        Cell::new("Next backoff"),
        Cell::new(format!("{}h", status.backoff_hours)),
    ]);
    table.add_row(vec![
        Cell::new("Cached tickers"),
        Cell::new(status.cached_tickers),
    ]);
    table.add_row(vec![
        Cell::new("Last price refresh"),
        ui::format_optional_cell(status.last_price_refresh, |at| at.format("%Y-%m-%d %H:%M UTC").to_string()),
    ]);

    println!("{}\n{table}", ui::style_text("Market data status", ui::StyleType::Title));
    Ok(())
}
