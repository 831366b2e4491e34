use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use common::types::TradeSide;
use std::collections::{BTreeMap, VecDeque};

/// Quantities at or below this are treated as fully consumed. Broker CSVs
/// round to four decimals, so anything smaller is float noise.
const QTY_EPSILON: f64 = 1e-4;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("file is empty or has no header row")]
    EmptyFile,
    #[error("missing required columns: {0:?}")]
    MissingColumns(Vec<String>),
    #[error("no tradeable rows found (every row was a non-trade or malformed)")]
    NoValidRows,
    #[error("CSV read error: {0}")]
    Csv(#[from] csv::Error),
}

/// One round trip: an entry matched against an exit.
#[derive(Debug, Clone, PartialEq)]
pub struct Trade {
    pub ticker: String,
    pub side: TradeSide,
    pub quantity: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_price: f64,
    pub realized_pnl: f64,
    pub holding_period_secs: i64,
    pub entry_fees: f64,
    pub exit_fees: f64,
}

/// Unmatched remainder left in a ticker's queue after all fills are applied.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenPosition {
    pub ticker: String,
    pub side: TradeSide,
    pub quantity: f64,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
}

#[derive(Debug)]
pub struct ParsedHistory {
    pub trades: Vec<Trade>,
    pub open_positions: Vec<OpenPosition>,
    /// Malformed rows that looked like trades but could not be used
    /// (bad date, non-positive quantity or price, unknown action).
    pub skipped_rows: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActionKind {
    Buy,
    Sell,
    NonTrade,
    Unknown,
}

/// Map a broker action string to buy/sell. Non-trade activity rows
/// (dividends, journals, corporate actions) are recognized so they can be
/// dropped without counting against the upload.
fn normalize_action(raw: &str) -> ActionKind {
    let action = raw.trim().to_uppercase();
    if action.is_empty() {
        return ActionKind::Unknown;
    }
    match action.as_str() {
        "BUY" | "BUY TO OPEN" | "BUY TO CLOSE" => return ActionKind::Buy,
        "SELL" | "SELL TO OPEN" | "SELL TO CLOSE" | "SELL SHORT" | "SHORT" => {
            return ActionKind::Sell
        }
        _ => {}
    }
    const NON_TRADE_MARKERS: [&str; 14] = [
        "DIVIDEND",
        "SPLIT",
        "MERGER",
        "JOURNAL",
        "TRANSFER",
        "FEE",
        "INTEREST",
        "EXPIRED",
        "ASSIGNED",
        "EXERCISE",
        "DEPOSIT",
        "WITHDRAWAL",
        "WIRE",
        "REINVEST",
    ];
    if NON_TRADE_MARKERS.iter().any(|m| action.contains(m)) {
        return ActionKind::NonTrade;
    }
    // Some exports decorate actions ("Market Buy", "Sell (partial)").
    if action.contains("BUY") {
        return ActionKind::Buy;
    }
    if action.contains("SELL") || action.contains("SHORT") {
        return ActionKind::Sell;
    }
    ActionKind::Unknown
}

/// Parse a currency-ish cell: strips `$`, thousands separators, and spaces;
/// accounting-style parentheses mean negative.
fn parse_numeric(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | ' '))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    if let Some(inner) = cleaned.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
        return inner.parse::<f64>().ok().map(|v| -v);
    }
    cleaned.parse::<f64>().ok()
}

/// Parse the timestamp formats seen in real broker exports. Dates without a
/// time component are taken at midnight UTC. Settlement annotations like
/// "07/01/2024 as of 06/30/2024" keep the first (transaction) date.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    let cleaned = match trimmed.to_lowercase().find(" as of ") {
        Some(idx) => trimmed[..idx].trim(),
        None => trimmed,
    };
    if cleaned.is_empty() {
        return None;
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(cleaned) {
        return Some(t.with_timezone(&Utc));
    }
    const DATETIME_FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%m/%d/%Y %H:%M:%S",
        "%m/%d/%Y %H:%M",
    ];
    for fmt in DATETIME_FORMATS {
        if let Ok(t) = NaiveDateTime::parse_from_str(cleaned, fmt) {
            return Some(Utc.from_utc_datetime(&t));
        }
    }
    const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%m/%d/%Y", "%m/%d/%y"];
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(cleaned, fmt) {
            return Some(Utc.from_utc_datetime(&d.and_time(NaiveTime::MIN)));
        }
    }
    None
}

#[derive(Debug, Clone)]
struct Fill {
    time: DateTime<Utc>,
    action: ActionKind,
    symbol: String,
    quantity: f64,
    price: f64,
    fees: f64,
}

#[derive(Debug)]
struct Lot {
    quantity: f64,
    price: f64,
    time: DateTime<Utc>,
    fees: f64,
}

#[derive(Debug, Default)]
struct TickerBook {
    longs: VecDeque<Lot>,
    shorts: VecDeque<Lot>,
}

/// Close an incoming fill against the opposite-side queue, FIFO. Fees are
/// split proportionally to the matched quantity on both legs. Returns the
/// unmatched remainder (quantity, fees) to be opened on the fill's own side.
fn close_against(
    queue: &mut VecDeque<Lot>,
    fill: &Fill,
    closed_side: TradeSide,
    out: &mut Vec<Trade>,
) -> (f64, f64) {
    let mut remaining = fill.quantity;
    let mut remaining_fees = fill.fees;

    while remaining > QTY_EPSILON {
        let Some(lot) = queue.front_mut() else { break };
        let matched = remaining.min(lot.quantity);
        let entry_fee_share = if lot.quantity > 0.0 {
            lot.fees * (matched / lot.quantity)
        } else {
            0.0
        };
        let exit_fee_share = if remaining > 0.0 {
            remaining_fees * (matched / remaining)
        } else {
            0.0
        };

        let gross = match closed_side {
            TradeSide::Long => (fill.price - lot.price) * matched,
            TradeSide::Short => (lot.price - fill.price) * matched,
        };
        out.push(Trade {
            ticker: fill.symbol.clone(),
            side: closed_side,
            quantity: matched,
            entry_time: lot.time,
            exit_time: fill.time,
            entry_price: lot.price,
            exit_price: fill.price,
            realized_pnl: gross - entry_fee_share - exit_fee_share,
            holding_period_secs: (fill.time - lot.time).num_seconds().max(0),
            entry_fees: entry_fee_share,
            exit_fees: exit_fee_share,
        });

        lot.quantity -= matched;
        lot.fees -= entry_fee_share;
        remaining -= matched;
        remaining_fees -= exit_fee_share;
        if lot.quantity <= QTY_EPSILON {
            queue.pop_front();
        }
    }

    (remaining, remaining_fees)
}

impl TickerBook {
    fn apply(&mut self, fill: &Fill, out: &mut Vec<Trade>) {
        match fill.action {
            ActionKind::Buy => {
                // A buy covers outstanding shorts first; any remainder opens long.
                let (remaining, remaining_fees) =
                    close_against(&mut self.shorts, fill, TradeSide::Short, out);
                if remaining > QTY_EPSILON {
                    self.longs.push_back(Lot {
                        quantity: remaining,
                        price: fill.price,
                        time: fill.time,
                        fees: remaining_fees,
                    });
                }
            }
            ActionKind::Sell => {
                let (remaining, remaining_fees) =
                    close_against(&mut self.longs, fill, TradeSide::Long, out);
                if remaining > QTY_EPSILON {
                    self.shorts.push_back(Lot {
                        quantity: remaining,
                        price: fill.price,
                        time: fill.time,
                        fees: remaining_fees,
                    });
                }
            }
            ActionKind::NonTrade | ActionKind::Unknown => {}
        }
    }
}

/// Parse a broker trade-history CSV and reconstruct round trips.
///
/// Structural problems (no header, missing required columns, zero usable
/// rows) abort with [`ParseError`]. Individually malformed rows are skipped
/// and counted instead.
pub fn parse_trade_history(content: &str) -> Result<ParsedHistory, ParseError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let headers = reader.headers().map_err(|_| ParseError::EmptyFile)?.clone();
    if headers.is_empty() || headers.iter().all(|h| h.trim().is_empty()) {
        return Err(ParseError::EmptyFile);
    }

    let col = |names: &[&str]| -> Option<usize> {
        headers.iter().position(|h| {
            let h = h.trim().to_lowercase();
            names.iter().any(|n| h == *n)
        })
    };
    let date_col = col(&["date", "trade date", "run date"]);
    let action_col = col(&["action", "transaction type", "type"]);
    let symbol_col = col(&["symbol", "ticker"]);
    let quantity_col = col(&["quantity", "qty", "shares"]);
    let price_col = col(&["price", "price ($)"]);
    let fees_col = col(&["fees", "fees & comm", "commission", "commissions", "fee"]);

    let mut missing = Vec::new();
    for (idx, name) in [
        (date_col, "date"),
        (action_col, "action"),
        (symbol_col, "symbol"),
        (quantity_col, "quantity"),
        (price_col, "price"),
    ] {
        if idx.is_none() {
            missing.push(name.to_string());
        }
    }
    if !missing.is_empty() {
        return Err(ParseError::MissingColumns(missing));
    }
    let (date_col, action_col, symbol_col, quantity_col, price_col) = (
        date_col.unwrap_or_default(),
        action_col.unwrap_or_default(),
        symbol_col.unwrap_or_default(),
        quantity_col.unwrap_or_default(),
        price_col.unwrap_or_default(),
    );

    let mut fills: Vec<Fill> = Vec::new();
    let mut skipped = 0_usize;
    for record in reader.records() {
        let record = record?;
        let field = |idx: usize| record.get(idx).unwrap_or("");

        let action = normalize_action(field(action_col));
        match action {
            ActionKind::NonTrade => continue,
            ActionKind::Unknown => {
                skipped += 1;
                continue;
            }
            ActionKind::Buy | ActionKind::Sell => {}
        }

        let symbol = field(symbol_col).trim().to_uppercase();
        let time = parse_timestamp(field(date_col));
        let quantity = parse_numeric(field(quantity_col));
        let price = parse_numeric(field(price_col));
        let fees = fees_col
            .and_then(|idx| parse_numeric(field(idx)))
            .unwrap_or(0.0)
            .max(0.0);

        match (time, quantity, price) {
            (Some(time), Some(quantity), Some(price))
                if !symbol.is_empty() && quantity > 0.0 && price > 0.0 =>
            {
                fills.push(Fill {
                    time,
                    action,
                    symbol,
                    quantity,
                    price,
                    fees,
                });
            }
            _ => {
                tracing::debug!(row = ?record, "skipping malformed trade row");
                skipped += 1;
            }
        }
    }

    if fills.is_empty() {
        return Err(ParseError::NoValidRows);
    }

    // FIFO matching happens per ticker in time order. BTreeMap keeps the
    // open-position output deterministic across runs.
    let mut by_ticker: BTreeMap<String, Vec<Fill>> = BTreeMap::new();
    for fill in fills {
        by_ticker.entry(fill.symbol.clone()).or_default().push(fill);
    }

    let mut trades = Vec::new();
    let mut open_positions = Vec::new();
    for (ticker, mut ticker_fills) in by_ticker {
        ticker_fills.sort_by_key(|f| f.time);
        let mut book = TickerBook::default();
        for fill in &ticker_fills {
            book.apply(fill, &mut trades);
        }
        for lot in book.longs {
            open_positions.push(OpenPosition {
                ticker: ticker.clone(),
                side: TradeSide::Long,
                quantity: lot.quantity,
                entry_time: lot.time,
                entry_price: lot.price,
            });
        }
        for lot in book.shorts {
            open_positions.push(OpenPosition {
                ticker: ticker.clone(),
                side: TradeSide::Short,
                quantity: lot.quantity,
                entry_time: lot.time,
                entry_price: lot.price,
            });
        }
    }
    trades.sort_by_key(|t| t.exit_time);

    Ok(ParsedHistory {
        trades,
        open_positions,
        skipped_rows: skipped,
    })
}
