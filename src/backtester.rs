use crate::config::{EngineConfig, SignalConfig};
use crate::engine::{BacktestRun, Engine};
use crate::models::PriceHistory;
use crate::signals::{SignalEngine, SignalSource};
use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::result::Result as StdResult;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

struct InstrumentTask {
    history: PriceHistory,
}

struct InstrumentResultMsg {
    ticker: String,
    duration_secs: f64,
    run: StdResult<BacktestRun, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchFailure {
    pub ticker: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchOutcome {
    /// Successful runs sorted by ticker.
    pub runs: Vec<BacktestRun>,
    pub failures: Vec<BatchFailure>,
}

impl BatchOutcome {
    pub fn total_pnl(&self) -> f64 {
        self.runs.iter().map(|run| run.performance.total_pnl).sum()
    }

    pub fn total_trades(&self) -> usize {
        self.runs.iter().map(|run| run.trades.len()).sum()
    }
}

/// Backtests many instruments on a bounded worker pool. Each instrument gets
/// its own engine run, so no position, capital or ledger is shared.
pub struct BatchBacktester {
    engine_config: EngineConfig,
    signal_config: SignalConfig,
    workers: Option<usize>,
    show_progress: bool,
}

impl BatchBacktester {
    pub fn new(engine_config: EngineConfig, signal_config: SignalConfig) -> Self {
        Self {
            engine_config,
            signal_config,
            workers: None,
            show_progress: true,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers.max(1));
        self
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn run(&self, histories: Vec<PriceHistory>) -> Result<BatchOutcome> {
        let source: Arc<dyn SignalSource> =
            Arc::new(SignalEngine::new(self.signal_config.clone()));
        self.run_with_source(histories, source)
    }

    pub fn run_with_source(
        &self,
        histories: Vec<PriceHistory>,
        source: Arc<dyn SignalSource>,
    ) -> Result<BatchOutcome> {
        let total = histories.len();
        if total == 0 {
            warn!("No price histories available to backtest.");
            return Ok(BatchOutcome::default());
        }

        let requested = self.workers.unwrap_or_else(num_cpus::get);
        let num_workers = std::cmp::min(total, std::cmp::max(1, requested));
        info!(
            "Backtesting {} instrument{} on {} worker thread{}",
            total,
            if total == 1 { "" } else { "s" },
            num_workers,
            if num_workers == 1 { "" } else { "s" }
        );

        let (task_tx, task_rx): (Sender<InstrumentTask>, Receiver<InstrumentTask>) =
            bounded(total);
        let (result_tx, result_rx): (Sender<InstrumentResultMsg>, Receiver<InstrumentResultMsg>) =
            bounded(total);

        let mut handles = Vec::new();
        for _ in 0..num_workers {
            let rx = task_rx.clone();
            let result_tx = result_tx.clone();
            let source = Arc::clone(&source);
            let engine_config = self.engine_config.clone();

            let handle = thread::spawn(move || {
                while let Ok(task) = rx.recv() {
                    let InstrumentTask { history } = task;
                    let ticker = history.ticker().to_string();
                    let start = Instant::now();
                    let run: StdResult<BacktestRun, String> =
                        match panic::catch_unwind(AssertUnwindSafe(|| {
                            Engine::new(engine_config.clone()).backtest(&history, source.as_ref())
                        })) {
                            Ok(Ok(run)) => Ok(run),
                            Ok(Err(err)) => Err(format!("{:#}", err)),
                            Err(_) => Err("backtest panicked".to_string()),
                        };

                    let message = InstrumentResultMsg {
                        ticker,
                        duration_secs: start.elapsed().as_secs_f64(),
                        run,
                    };
                    if result_tx.send(message).is_err() {
                        break;
                    }
                }
            });
            handles.push(handle);
        }
        drop(result_tx);

        for history in histories {
            task_tx
                .send(InstrumentTask { history })
                .map_err(|_| anyhow!("Backtest workers stopped before all tasks were queued"))?;
        }
        drop(task_tx);

        let pb = if self.show_progress {
            ProgressBar::new(total as u64)
        } else {
            ProgressBar::hidden()
        };
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
                )?
                .progress_chars("#>-"),
        );

        let mut outcome = BatchOutcome::default();
        let mut completed = 0usize;
        while completed < total {
            match result_rx.recv() {
                Ok(message) => {
                    completed += 1;
                    pb.set_position(completed as u64);
                    match message.run {
                        Ok(run) => {
                            info!(
                                "Completed backtest for {} ({} trade{}, P&L {:.2}, {:.2}s)",
                                message.ticker,
                                run.trades.len(),
                                if run.trades.len() == 1 { "" } else { "s" },
                                run.performance.total_pnl,
                                message.duration_secs
                            );
                            pb.set_message(message.ticker);
                            outcome.runs.push(run);
                        }
                        Err(error) => {
                            warn!("Backtest failed for {}: {}", message.ticker, error);
                            outcome.failures.push(BatchFailure {
                                ticker: message.ticker,
                                error,
                            });
                        }
                    }
                }
                Err(_) => {
                    warn!("Result channel closed unexpectedly. Some results may be lost.");
                    break;
                }
            }
        }

        for handle in handles {
            let _ = handle.join();
        }

        if outcome.failures.is_empty() {
            pb.finish_with_message("Backtesting completed");
        } else {
            pb.finish_with_message("Backtesting completed with errors");
            warn!(
                "Backtesting completed with {} failure{}",
                outcome.failures.len(),
                if outcome.failures.len() == 1 { "" } else { "s" }
            );
        }

        outcome.runs.sort_by(|a, b| a.ticker.cmp(&b.ticker));
        outcome.failures.sort_by(|a, b| a.ticker.cmp(&b.ticker));
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PriceBar, SignalAction, SignalDecision};
    use chrono::{Duration, TimeZone, Utc};

    /// Buys on the first evaluated bar, holds otherwise.
    struct FirstBarBuyer;

    impl SignalSource for FirstBarBuyer {
        fn id(&self) -> &str {
            "first_bar_buyer"
        }

        fn min_data_points(&self) -> usize {
            0
        }

        fn generate_signal(&self, bars: &[PriceBar]) -> SignalDecision {
            if bars.len() == 53 {
                SignalDecision {
                    action: SignalAction::Buy,
                    confidence: 80.0,
                    ..SignalDecision::hold("first bar")
                }
            } else {
                SignalDecision::hold("waiting")
            }
        }
    }

    fn history(ticker: &str, count: usize, step: f64) -> PriceHistory {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let bars = (0..count)
            .map(|i| {
                let close = 100.0 + step * i as f64;
                PriceBar {
                    date: start + Duration::days(i as i64),
                    open: close,
                    high: close,
                    low: close,
                    close,
                    volume: 1_000.0,
                }
            })
            .collect();
        PriceHistory::new(ticker, bars).unwrap()
    }

    #[test]
    fn failures_are_isolated_and_results_sorted() {
        let backtester = BatchBacktester::new(EngineConfig::default(), SignalConfig::default())
            .with_workers(3)
            .with_progress(false);
        let histories = vec![
            history("TLKM", 60, 0.0),
            history("SHORT", 20, 0.0),
            history("ASII", 60, 0.0),
        ];
        let outcome = backtester
            .run_with_source(histories, Arc::new(FirstBarBuyer))
            .unwrap();

        let tickers: Vec<&str> = outcome.runs.iter().map(|run| run.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["ASII", "TLKM"]);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].ticker, "SHORT");
        assert!(outcome.failures[0].error.contains("insufficient data"));

        for run in &outcome.runs {
            assert_eq!(run.trades.len(), 1);
            assert_eq!(run.initial_capital, 10_000_000.0);
            assert!((run.final_capital - run.initial_capital).abs() < 1e-9);
        }
    }

    #[test]
    fn each_instrument_starts_with_full_capital() {
        let backtester = BatchBacktester::new(EngineConfig::default(), SignalConfig::default())
            .with_workers(1)
            .with_progress(false);
        let outcome = backtester
            .run_with_source(
                vec![history("RISE", 60, 1.0), history("FALL", 60, -0.5)],
                Arc::new(FirstBarBuyer),
            )
            .unwrap();
        assert_eq!(outcome.runs.len(), 2);
        for run in &outcome.runs {
            let expected_shares = (run.initial_capital * 0.8 / run.trades[0].entry_price).floor() as i64;
            assert_eq!(run.trades[0].shares, expected_shares);
        }
        assert_eq!(outcome.total_trades(), 2);
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let outcome = BatchBacktester::new(EngineConfig::default(), SignalConfig::default())
            .with_progress(false)
            .run(Vec::new())
            .unwrap();
        assert!(outcome.runs.is_empty());
        assert!(outcome.failures.is_empty());
    }
}
