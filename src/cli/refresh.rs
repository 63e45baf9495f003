use super::ui;
use crate::core::MarketData;
use crate::core::refresher::{RefreshStatus, SkipReason};
use anyhow::Result;

/// What a one-off `refresh` run should touch. Nothing selected means all.
#[derive(Debug, Clone, Copy, Default)]
pub struct RefreshTargets {
    pub prices: bool,
    pub dividends: bool,
    pub rate: bool,
}

impl RefreshTargets {
    fn all(self) -> bool {
        !(self.prices || self.dividends || self.rate)
    }
}

pub async fn run(market: &MarketData, targets: RefreshTargets) -> Result<()> {
    if let Some(until) = market.governor().paused_until().filter(|_| market.governor().is_paused()) {
        println!(
            "{}",
            ui::style_text(
                &format!("Upstream access paused until {}; serving cached data only.", until.format("%Y-%m-%d %H:%M UTC")),
                ui::StyleType::Warning
            )
        );
        return Ok(());
    }
    let all = targets.all();

    if all || targets.rate {
        let spinner = ui::new_spinner("Refreshing exchange rate");
        let rate = market.refresh_exchange_rate().await;
        spinner.finish_and_clear();
        println!("Exchange rate: {rate}");
    }

    if all || targets.prices {
        let spinner = ui::new_spinner("Refreshing prices");
        let outcome = market.refresh_prices_now().await;
        spinner.finish_and_clear();
        let summary = match outcome.status {
            RefreshStatus::Completed => ui::style_text(
                &format!("Updated {} of {} tickers", outcome.updated, outcome.total_requested),
                ui::StyleType::TotalValue,
            ),
            RefreshStatus::Skipped(SkipReason::Paused) => {
                ui::style_text("Skipped: upstream access paused", ui::StyleType::Warning)
            }
            RefreshStatus::Skipped(SkipReason::Recent) => {
                ui::style_text("Skipped: refreshed recently", ui::StyleType::Subtle)
            }
            RefreshStatus::Aborted => {
                ui::style_text("Aborted: connectivity probe failed", ui::StyleType::Error)
            }
            RefreshStatus::Systemic => {
                ui::style_text("Failed: upstream rejected the batch, cache kept", ui::StyleType::Error)
            }
        };
        println!("{summary}");
        if outcome.evicted > 0 {
            println!(
                "{}",
                ui::style_text(
                    &format!("Evicted possibly delisted: {}", outcome.delisted_tickers.join(", ")),
                    ui::StyleType::Warning
                )
            );
        }
    }

    if all || targets.dividends {
        let spinner = ui::new_spinner("Refreshing dividends");
        let outcome = market.refresh_dividends().await;
        spinner.finish_and_clear();
        println!(
            "Dividends: {} new, {} owners refreshed, {} already current",
            outcome.inserted, outcome.owners_refreshed, outcome.owners_skipped
        );
        if !outcome.failed_owners.is_empty() {
            println!(
                "{}",
                ui::style_text(&format!("Failed for: {}", outcome.failed_owners.join(", ")), ui::StyleType::Error)
            );
        }
    }

    market.persist()?;
    Ok(())
}
