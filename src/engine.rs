// =============================================================================
// Trading engine — the per-day orchestration of every subsystem
// =============================================================================
//
// One engine instance runs one trading process. At startup it resolves the
// account, sizes the compound pool from the live balance, restores any
// position snapshot, and spawns the background tasks:
//
//   * keep-alive loop per environment (live mode only)
//   * quote polling on the minute for the watchlist + SPY baseline
//   * the market-minute tick: ORB capture at open+15m, SO evaluation at
//     open+45m, the ORR scan through the window, signal fan-out to the
//     equity executor and the 0DTE manager
//   * the exit monitor and its close-intent worker
//   * the options exit monitor
//   * the 06:00 ADV refresh
//   * the status API listener and the event logger
//
// All tasks watch one shutdown flag and suspend cleanly; the engine never
// exits because a single component failed — it logs, alerts, and continues.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::adv::AdvCache;
use crate::api::health::{self, ApiState};
use crate::broker::client::fetch_quotes_bounded;
use crate::broker::{Broker, EtradeClient, SimBroker};
use crate::compound::CompoundEngine;
use crate::config::{AppConfig, RuntimeConfig};
use crate::events::{self, EngineEvent, EventSink};
use crate::exit::collector::ExitCollector;
use crate::exit::monitor::{run_close_worker, ExitMonitor, INTENT_QUEUE_DEPTH};
use crate::exit::registry::PositionBook;
use crate::exit::snapshot::SnapshotWriter;
use crate::exit::ExitConfig;
use crate::execution::ExecutionManager;
use crate::market::candles::CandleStore;
use crate::market::clock::{MarketClock, SessionPhase};
use crate::market::eastern;
use crate::market::red_day;
use crate::oauth::keepalive::run_keepalive_loop;
use crate::oauth::token_store::TokenStore;
use crate::oauth::vault::TokenVault;
use crate::oauth::OAuthSession;
use crate::options::exits::OptionsBook;
use crate::options::manager::{DayFlags, ZeroDteManager};
use crate::orb::signals::{SO_EVAL_MINUTE, ORR_WINDOW};
use crate::orb::{OrbBook, OrbSignal, SignalEngine};
use crate::ranker::{self, SizingInputs};
use crate::types::TradeMode;
use crate::watchlist::Watchlist;

/// ORB capture minute (from session open).
const ORB_CAPTURE_MINUTE: i64 = 15;
/// SPY session return below which the day is flagged red.
const RED_DAY_SPY_RETURN_PCT: f64 = -0.5;
/// SPY ATR (percent of price) above which entries are suspended.
const EXTREME_VOL_ATR_PCT: f64 = 1.0;

/// Everything the trading process shares.
pub struct TradingEngine {
    pub config: Arc<AppConfig>,
    pub runtime: RuntimeConfig,
    pub clock: Arc<MarketClock>,
    pub store: Arc<CandleStore>,
    pub watchlist: Arc<Watchlist>,
    pub orb_book: Arc<OrbBook>,
    pub signals: Arc<SignalEngine>,
    pub book: Arc<PositionBook>,
    pub options_book: Arc<OptionsBook>,
    pub compound: Arc<CompoundEngine>,
    pub adv: Arc<AdvCache>,
    pub broker: Arc<dyn Broker>,
    pub session: Arc<OAuthSession>,
    pub account_id_key: String,
    pub events: EventSink,
    /// The SO pass runs once per day at open+45m.
    so_pass_done: std::sync::atomic::AtomicBool,
}

impl TradingEngine {
    /// Resolve the account, size the pool, and assemble the shared state.
    pub async fn bootstrap(
        config: Arc<AppConfig>,
        runtime: RuntimeConfig,
        events: EventSink,
    ) -> Result<Self> {
        let clock = Arc::new(MarketClock::new());
        let store = Arc::new(CandleStore::new());

        let watchlist = match Watchlist::load(&config.watchlist_path) {
            Ok(list) if !list.is_empty() => list,
            Ok(_) | Err(_) => {
                warn!(
                    path = %config.watchlist_path.display(),
                    "watchlist missing or empty — using the default ETF universe"
                );
                Watchlist::from_tickers(&[
                    "SPY", "QQQ", "IWM", "TQQQ", "SQQQ", "SPXL", "SOXL", "UPRO",
                ])
            }
        };
        let watchlist = Arc::new(watchlist);

        let vault = TokenVault::open(config.state_dir.join(".keys/token.key"))?;
        let session = Arc::new(OAuthSession::new(
            config.clone(),
            TokenStore::new(&config.state_dir, vault),
        ));

        let broker: Arc<dyn Broker> = match config.trade_mode {
            TradeMode::Demo => Arc::new(SimBroker::new()),
            TradeMode::Live => Arc::new(EtradeClient::new(session.clone(), config.environment)),
        };

        // Resolve the trading account key.
        let accounts = broker
            .list_accounts()
            .await
            .context("failed to list accounts at startup")?;
        let account = accounts
            .first()
            .context("no brokerage account available")?;
        let balance = broker.get_balance(&account.account_id_key).await?;
        info!(
            account_id = %account.account_id,
            account_value = balance.account_value,
            "trading account resolved"
        );

        // Same-day restarts resume the capital state; otherwise the pool is
        // sized fresh from the live balance.
        let compound_path = config.state_dir.join("compound_state.json");
        let today = eastern::eastern_date(Utc::now());
        let compound = Arc::new(
            CompoundEngine::restore(&compound_path, today)
                .unwrap_or_else(|| CompoundEngine::new(balance.account_value.max(1.0))),
        );

        let adv = Arc::new(AdvCache::new(
            config.state_dir.join("adv_cache.json"),
            config.slip_guard_enabled,
            config.slip_guard_lookback_days,
        ));
        if adv.is_stale(Utc::now()) {
            events.publish(EngineEvent::DataQuality {
                at: Utc::now(),
                detail: "ADV cache stale or empty at startup".into(),
            });
        }

        let book = Arc::new(PositionBook::new(runtime.stop_cooldown_secs));
        let snapshots = SnapshotWriter::new(config.state_dir.join("positions.json"));
        let restored = snapshots.restore(&book).unwrap_or(0);
        if restored > 0 {
            info!(restored, "resumed open positions from the last snapshot");
        }

        Ok(Self {
            account_id_key: account.account_id_key.clone(),
            config,
            runtime,
            clock,
            store,
            watchlist,
            orb_book: Arc::new(OrbBook::new()),
            signals: Arc::new(SignalEngine::new()),
            book,
            options_book: Arc::new(OptionsBook::new()),
            compound,
            adv,
            broker,
            session,
            events,
            so_pass_done: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// SPY session return since open, in percent.
    fn spy_return_pct(&self) -> f64 {
        let bars = self.store.minute_bars("SPY", 500);
        match (bars.first(), self.store.last_price("SPY")) {
            (Some(first), Some(last)) if first.open > 0.0 => {
                (last - first.open) / first.open * 100.0
            }
            _ => 0.0,
        }
    }

    /// Grade the day from the batch plus the index tape.
    fn assess_day(&self, batch: &[OrbSignal]) -> (red_day::RedDayAssessment, DayFlags) {
        let spy_return = self.spy_return_pct();
        let spy_vwap_distance = self
            .store
            .tape("SPY")
            .map(|t| {
                if t.vwap > 0.0 {
                    (t.last_price - t.vwap) / t.vwap * 100.0
                } else {
                    0.0
                }
            })
            .unwrap_or(0.0);

        let assessment = red_day::assess(
            batch,
            red_day::IndexContext {
                spy_return_pct: spy_return,
                spy_vwap_distance_pct: spy_vwap_distance,
            },
        );

        let bars = self.store.minute_bars("SPY", 60);
        let extreme = crate::indicators::atr::latest_pct(&bars, 14)
            .map(|atr_pct| atr_pct > EXTREME_VOL_ATR_PCT)
            .unwrap_or(false);

        let flags = DayFlags {
            is_red_day: assessment.is_red_day || spy_return < RED_DAY_SPY_RETURN_PCT,
            extreme_volatility: extreme,
        };
        (assessment, flags)
    }

    /// Rank, size, and execute a freshly emitted signal batch, then hand the
    /// same batch to the 0DTE manager.
    async fn dispatch_signals(
        &self,
        batch: Vec<OrbSignal>,
        executor: &ExecutionManager,
        zero_dte: &ZeroDteManager,
        now: chrono::DateTime<Utc>,
    ) {
        if batch.is_empty() {
            return;
        }
        let composition = crate::orb::quality::analyze(&batch, &self.watchlist);
        info!(
            count = batch.len(),
            longs = composition.long_count,
            shorts = composition.short_count,
            leveraged_pct = format!("{:.0}%", composition.leveraged_pct * 100.0),
            best_grade = composition.best_grade.map(|g| g.to_string()).unwrap_or_default(),
            "dispatching signal batch"
        );
        if composition.one_way_leveraged {
            warn!("batch is one-way leveraged — reversal risk is concentrated");
        }

        let (assessment, flags) = self.assess_day(&batch);
        let size_multiplier = assessment.recommendation.size_multiplier();

        if size_multiplier > 0.0 {
            let mut ranked = ranker::allocate(
                ranker::rank(batch.clone()),
                SizingInputs {
                    total_account: self.compound.total_account(),
                    trading_capital_pct: self.runtime.trading_capital_pct,
                    max_position_pct: self.runtime.max_position_pct,
                    max_concurrent: self.runtime.max_concurrent_positions,
                },
            );
            if size_multiplier < 1.0 {
                warn!(
                    multiplier = size_multiplier,
                    risk = assessment.risk_score,
                    "day risk reduces position sizing"
                );
                for entry in ranked.iter_mut() {
                    entry.capital_allocated *= size_multiplier;
                }
            }

            let watchlist = self.watchlist.clone();
            executor
                .execute_ranked(
                    ranked,
                    move |ticker| {
                        watchlist.get(ticker).map(|w| w.is_leveraged).unwrap_or(false)
                    },
                    now,
                )
                .await;
        } else {
            warn!(
                risk = assessment.risk_score,
                "red-day detector stands the equity book down for this batch"
            );
        }

        if self.runtime.options_enabled {
            let outcomes = zero_dte.process_signals(&batch, flags, now).await;
            for (ticker, outcome) in outcomes {
                match outcome {
                    Ok(kind) => info!(symbol = %ticker, kind = %kind, "0DTE trade opened"),
                    Err(skip) => info!(symbol = %ticker, reason = %skip, "0DTE skipped"),
                }
            }
        }
    }

    /// The market-minute tick: ORB capture, SO evaluation, ORR scan.
    async fn minute_tick(
        &self,
        executor: &ExecutionManager,
        zero_dte: &ZeroDteManager,
        now: chrono::DateTime<Utc>,
    ) {
        if self.clock.phase(now) != SessionPhase::Open {
            return;
        }
        let Some(minutes) = self.clock.minutes_since_open(now) else {
            return;
        };
        let date = eastern::eastern_date(now);
        let session_open = self.clock.open_instant(date);

        // ── ORB capture at open+15m ─────────────────────────────────────
        if minutes >= ORB_CAPTURE_MINUTE && self.orb_book.captured_count() == 0 {
            for ticker in self.watchlist.tickers() {
                let _ = self
                    .orb_book
                    .capture(&self.store, &ticker, date, session_open);
            }
            info!(
                captured = self.orb_book.captured_count(),
                total = self.watchlist.len(),
                "opening ranges captured"
            );
        }

        let spy_return = self.spy_return_pct();
        let mut batch = Vec::new();

        // ── SO evaluation, once, at open+45m ────────────────────────────
        let so_due = minutes >= SO_EVAL_MINUTE
            && !self.so_pass_done.swap(true, std::sync::atomic::Ordering::SeqCst);
        if so_due {
            for ticker in self.watchlist.tickers() {
                if let Some(signal) = self.signals.evaluate_so(
                    &self.store,
                    &self.orb_book,
                    &ticker,
                    session_open,
                    now,
                    spy_return,
                ) {
                    batch.push(signal);
                }
            }
        }

        // ── ORR scan inside its window ──────────────────────────────────
        if (ORR_WINDOW.0..=ORR_WINDOW.1).contains(&minutes) {
            for ticker in self.watchlist.tickers() {
                if let Some(signal) = self.signals.scan_orr(
                    &self.store,
                    &self.orb_book,
                    &ticker,
                    minutes,
                    now,
                    spy_return,
                ) {
                    batch.push(signal);
                }
            }
        }

        self.dispatch_signals(batch, executor, zero_dte, now).await;
    }

    /// Poll quotes for the watchlist (plus the SPY baseline) into the store.
    async fn poll_quotes(&self) {
        let mut symbols = self.watchlist.tickers();
        if !symbols.iter().any(|s| s == "SPY") {
            symbols.push("SPY".to_string());
        }
        let quotes =
            fetch_quotes_bounded(self.broker.as_ref(), &symbols, self.runtime.broker_call_limit)
                .await;
        let now = Utc::now();
        for (symbol, quote) in quotes {
            self.store
                .record_quote(&symbol, now, quote.last, quote.bid, quote.ask, quote.volume);
        }
    }

    /// Run the whole process until `shutdown` flips.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let events = self.events.clone();

        // ── Keep-alive (live mode only) ─────────────────────────────────
        if self.config.trade_mode == TradeMode::Live {
            tokio::spawn(run_keepalive_loop(
                self.session.clone(),
                self.config.environment,
                events.clone(),
                shutdown.clone(),
            ));
        }

        // ── Exit engine: monitor + close worker ─────────────────────────
        let (intent_tx, intent_rx) = mpsc::channel(INTENT_QUEUE_DEPTH);
        let snapshots = SnapshotWriter::new(self.config.state_dir.join("positions.json"));
        let collector = Arc::new(ExitCollector::new(
            self.config.state_dir.join("exit_records.json"),
        ));

        if self.config.exit_monitoring_enabled {
            let monitor = Arc::new(ExitMonitor::new(
                self.book.clone(),
                self.store.clone(),
                self.orb_book.clone(),
                self.clock.clone(),
                ExitConfig::default(),
                self.runtime.gap_risk_pct,
                intent_tx,
                snapshots.clone(),
                collector.clone(),
            ));
            tokio::spawn(monitor.run(self.runtime.monitor_interval_secs, shutdown.clone()));
        } else {
            warn!("exit monitoring DISABLED by configuration");
        }

        tokio::spawn(run_close_worker(
            intent_rx,
            self.broker.clone(),
            self.account_id_key.clone(),
            self.book.clone(),
            self.compound.clone(),
            events.clone(),
            snapshots,
            collector,
        ));

        // ── 0DTE manager + its monitor ──────────────────────────────────
        let zero_dte = Arc::new(ZeroDteManager::new(
            self.broker.clone(),
            self.account_id_key.clone(),
            self.options_book.clone(),
            self.store.clone(),
            self.clock.clone(),
            self.watchlist.clone(),
            events.clone(),
            self.runtime.options_account_value,
        ));
        if self.runtime.options_enabled {
            tokio::spawn(
                zero_dte
                    .clone()
                    .run_monitor(self.runtime.monitor_interval_secs, shutdown.clone()),
            );
        }

        // ── Execution manager ───────────────────────────────────────────
        let executor = ExecutionManager::new(
            self.broker.clone(),
            self.account_id_key.clone(),
            self.book.clone(),
            self.compound.clone(),
            self.adv.clone(),
            self.store.clone(),
            events.clone(),
        );

        // ── ADV refresh at 06:00 local ──────────────────────────────────
        {
            let engine = self.clone();
            let mut adv_shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_secs(600)) => {}
                        _ = adv_shutdown.changed() => {
                            if *adv_shutdown.borrow() { return; }
                        }
                    }
                    let et = eastern::eastern_time(Utc::now());
                    let is_refresh_window = et.format("%H").to_string() == "06";
                    if is_refresh_window && engine.adv.is_stale(Utc::now()) {
                        engine.refresh_adv().await;
                    }
                }
            });
        }

        // ── Status API ──────────────────────────────────────────────────
        {
            let api_state = Arc::new(ApiState {
                clock: self.clock.clone(),
                session: self.session.clone(),
                environment: self.config.environment,
                trade_mode: self.config.trade_mode,
                book: self.book.clone(),
                options_book: self.options_book.clone(),
                compound: self.compound.clone(),
                started_at: std::time::Instant::now(),
            });
            let bind_addr = self.config.bind_addr.clone();
            tokio::spawn(async move {
                let app = health::router(api_state);
                match tokio::net::TcpListener::bind(&bind_addr).await {
                    Ok(listener) => {
                        info!(addr = %bind_addr, "status API listening");
                        if let Err(e) = axum::serve(listener, app).await {
                            error!(error = %e, "status API failed");
                        }
                    }
                    Err(e) => error!(addr = %bind_addr, error = %e, "status API bind failed"),
                }
            });
        }

        info!("all subsystems running");

        // ── The market-minute loop drives everything else ───────────────
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut main_shutdown = shutdown;
        let mut last_date = eastern::eastern_date(Utc::now());

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = main_shutdown.changed() => {
                    if *main_shutdown.borrow() {
                        info!("engine loop stopping");
                        return Ok(());
                    }
                }
            }

            let now = Utc::now();

            // Daily reset when the ET date rolls.
            let today = eastern::eastern_date(now);
            if today != last_date {
                info!(date = %today, "new session date — resetting intraday state");
                self.store.reset();
                self.orb_book.reset();
                self.signals.reset();
                self.so_pass_done
                    .store(false, std::sync::atomic::Ordering::SeqCst);
                last_date = today;
            }

            match self.clock.phase(now) {
                SessionPhase::Open => {
                    self.poll_quotes().await;
                    self.minute_tick(&executor, &zero_dte, now).await;
                }
                SessionPhase::Prep => {
                    // Warm the tape so the open has context.
                    self.poll_quotes().await;
                }
                SessionPhase::Cooldown | SessionPhase::Dark => {}
            }
        }
    }

    /// Refresh the ADV dataset from daily quote data. Falls back to the
    /// disk cache (already loaded) on failure.
    async fn refresh_adv(&self) {
        let symbols = self.watchlist.tickers();
        let quotes =
            fetch_quotes_bounded(self.broker.as_ref(), &symbols, self.runtime.broker_call_limit)
                .await;
        if quotes.is_empty() {
            warn!("ADV refresh produced no data — keeping the disk cache");
            self.events.publish(EngineEvent::DataQuality {
                at: Utc::now(),
                detail: "ADV refresh failed; serving stale cache".into(),
            });
            return;
        }
        // Dollar volume proxy from the latest session: last × cumulative volume.
        let data: HashMap<String, f64> = quotes
            .into_iter()
            .filter(|(_, q)| q.last > 0.0 && q.volume > 0.0)
            .map(|(s, q)| (s, q.last * q.volume))
            .collect();
        if let Err(e) = self.adv.refresh(data, Utc::now()) {
            warn!(error = %e, "failed to persist refreshed ADV data");
        }
    }
}

/// Run the demo/live trading process until Ctrl-C.
pub async fn run_trading(config: AppConfig) -> Result<()> {
    let config = Arc::new(config);
    let runtime_path = config.state_dir.join("runtime_config.json");
    let runtime = RuntimeConfig::load(&runtime_path).unwrap_or_else(|e| {
        warn!(error = %e, "runtime config missing — using defaults");
        RuntimeConfig::default()
    });

    let (event_tx, event_rx) = mpsc::channel(256);
    tokio::spawn(events::run_event_logger(event_rx));
    let events = EventSink::new(event_tx);

    let engine = Arc::new(TradingEngine::bootstrap(config, runtime.clone(), events).await?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = tokio::spawn(engine.clone().run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping tasks");
    let _ = shutdown_tx.send(true);
    let _ = runner.await;

    // Persist the day's state for an intraday restart.
    let today = eastern::eastern_date(Utc::now());
    if let Err(e) = engine
        .compound
        .persist(&engine.config.state_dir.join("compound_state.json"), today)
    {
        error!(error = %e, "failed to persist compound state");
    }
    if let Err(e) = engine
        .options_book
        .persist_history(&engine.config.state_dir.join("options_history.json"))
    {
        error!(error = %e, "failed to persist options history");
    }
    if let Err(e) = runtime.save(&engine.config.state_dir.join("runtime_config.json")) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }
    info!("engine shut down cleanly");
    Ok(())
}
