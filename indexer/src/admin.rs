//! Operator commands for inspecting and overriding cursor slots.
//!
//! Every override is built as a [`Proposal`] first; nothing is written until
//! [`apply`] is called, so the CLI can show a dry run by default.

use crate::cursor::{self, Cursor, HUMAN_FORMAT};
use crate::cursor_store::CursorStore;
use crate::model::RecordKind;
use crate::window::{Window, WindowCheck};
use chrono::{DateTime, Duration, FixedOffset, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use fleet_sync_core::config::parse_utc_offset;
use fleet_sync_core::{Error, Result};
use std::fmt;
use tracing::info;

const INPUT_FORMATS: [&str; 6] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

const MIN_TOKEN_LEN: usize = 14;

/// Zone an operator-entered wall-clock time is read in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputZone {
    Fixed(FixedOffset),
    Named(Tz),
}

impl fmt::Display for InputZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputZone::Fixed(offset) => write!(f, "{offset}"),
            InputZone::Named(tz) => write!(f, "{tz}"),
        }
    }
}

/// Resolves `--tz`, falling back to the configured display offset.
/// Fixed offsets win over zone names, so `UTC` stays a plain offset.
pub fn resolve_zone(raw: Option<&str>, fallback: FixedOffset) -> Result<InputZone> {
    let Some(raw) = raw else {
        return Ok(InputZone::Fixed(fallback));
    };
    parse_utc_offset(raw)
        .map(InputZone::Fixed)
        .or_else(|| raw.trim().parse::<Tz>().ok().map(InputZone::Named))
        .ok_or_else(|| {
            Error::Validation(format!(
                "invalid timezone '{raw}'; use an IANA name (e.g. America/Manaus), UTC, Z, +HH:MM, -HH:MM or decimal hours"
            ))
        })
}

/// Parses a wall-clock datetime in `zone` and returns it in UTC.
/// Times skipped or repeated by a DST transition are rejected.
pub fn parse_datetime(input: &str, zone: &InputZone) -> Result<DateTime<Utc>> {
    let input = input.trim();
    let naive = INPUT_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(input, format).ok())
        .ok_or_else(|| {
            Error::Validation(format!(
                "unrecognised datetime '{input}'; expected one of: {}",
                INPUT_FORMATS.join(", ")
            ))
        })?;

    let resolved = match zone {
        InputZone::Fixed(offset) => offset.from_local_datetime(&naive).map(|dt| dt.with_timezone(&Utc)),
        InputZone::Named(tz) => tz.from_local_datetime(&naive).map(|dt| dt.with_timezone(&Utc)),
    };

    match resolved {
        LocalResult::Single(utc) => Ok(utc),
        LocalResult::Ambiguous(earlier, later) => Err(Error::Validation(format!(
            "'{input}' occurs twice in {zone} ({} and {} UTC); pass an explicit offset with --tz",
            earlier.format(HUMAN_FORMAT),
            later.format(HUMAN_FORMAT)
        ))),
        LocalResult::None => Err(Error::Validation(format!("'{input}' does not exist in {zone}"))),
    }
}

/// Snapshot of one slot for `cursor show`.
#[derive(Debug, Clone)]
pub struct CursorStatus {
    pub kind: RecordKind,
    pub location: String,
    pub cursor: Option<Cursor>,
    pub check: WindowCheck,
    pub display_tz: FixedOffset,
    pub now: DateTime<Utc>,
}

impl CursorStatus {
    pub fn label(&self) -> &'static str {
        match (&self.cursor, self.check.is_valid) {
            (None, _) => "none stored",
            (Some(_), true) => "OK",
            (Some(_), false) => "OUT OF WINDOW",
        }
    }
}

impl fmt::Display for CursorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let raw = self.cursor.as_ref().map(Cursor::as_str);
        writeln!(f, "kind:     {}", self.kind)?;
        writeln!(f, "slot:     {}", self.location)?;
        writeln!(f, "cursor:   {}", raw.unwrap_or("-"))?;
        writeln!(
            f,
            "local:    {} (UTC{})",
            cursor::render_human(raw, &self.display_tz, HUMAN_FORMAT),
            self.display_tz
        )?;
        writeln!(f, "utc:      {}", cursor::render_human(raw, &Utc, HUMAN_FORMAT))?;
        writeln!(
            f,
            "age:      {}",
            self.check.age.map(cursor::format_age).unwrap_or_else(|| "-".to_string())
        )?;
        writeln!(f, "limit:    {}", cursor::format_age(self.check.limit))?;
        writeln!(f, "status:   {}", self.label())?;
        write!(
            f,
            "now:      {} UTC",
            self.now.format(HUMAN_FORMAT)
        )
    }
}

pub async fn status(
    store: &dyn CursorStore,
    window: &Window,
    kind: RecordKind,
    display_tz: FixedOffset,
) -> Result<CursorStatus> {
    let cursor = store.load(kind).await?;
    Ok(CursorStatus {
        kind,
        location: store.location(kind),
        check: window.check(cursor.as_ref()),
        cursor,
        display_tz,
        now: window.now(),
    })
}

/// A cursor an operator intends to store, with everything needed to review it.
#[derive(Debug, Clone)]
pub struct Proposal {
    pub kind: RecordKind,
    pub cursor: Cursor,
    pub check: WindowCheck,
    /// Informational end bound: its token and the span from the start.
    pub end: Option<(Cursor, Duration)>,
    pub warnings: Vec<String>,
}

impl Proposal {
    fn new(window: &Window, kind: RecordKind, cursor: Cursor, force: bool) -> Result<Self> {
        let check = window.check(Some(&cursor));
        let mut warnings = Vec::new();

        if !check.is_valid {
            let age = check
                .age
                .map(cursor::format_age)
                .unwrap_or_else(|| cursor::INVALID_MARKER.to_string());
            let message = format!(
                "{cursor} is outside the lookback window (age {age}, limit {})",
                cursor::format_age(check.limit)
            );
            if !force {
                return Err(Error::Validation(format!("{message}; pass --force to override")));
            }
            warnings.push(message);
        }

        Ok(Self {
            kind,
            cursor,
            check,
            end: None,
            warnings,
        })
    }

    fn with_end(mut self, end: DateTime<Utc>) -> Self {
        if let Some(start) = self.check.parsed {
            let span = end - start;
            if span <= Duration::zero() {
                self.warnings
                    .push(format!("end is not after start (span {})", cursor::format_age(span)));
            }
            self.end = Some((cursor::encode(&end), span));
        }
        self
    }

    pub fn render(&self, display_tz: &FixedOffset) -> String {
        let raw = Some(self.cursor.as_str());
        let mut lines = vec![
            format!("kind:     {}", self.kind),
            format!("cursor:   {}", self.cursor),
            format!(
                "local:    {} (UTC{display_tz})",
                cursor::render_human(raw, display_tz, HUMAN_FORMAT)
            ),
            format!("utc:      {}", cursor::render_human(raw, &Utc, HUMAN_FORMAT)),
            format!(
                "age:      {}",
                self.check.age.map(cursor::format_age).unwrap_or_else(|| "-".to_string())
            ),
        ];
        if let Some((end, span)) = &self.end {
            lines.push(format!("end:      {end}"));
            lines.push(format!("span:     {}", cursor::format_age(*span)));
        }
        for warning in &self.warnings {
            lines.push(format!("warning:  {warning}"));
        }
        lines.join("\n")
    }
}

/// `cursor set`: a wall-clock start (and optional end) in `zone`.
pub fn propose_at(
    window: &Window,
    kind: RecordKind,
    start: &str,
    end: Option<&str>,
    zone: &InputZone,
    force: bool,
) -> Result<Proposal> {
    let start = parse_datetime(start, zone)?;
    let end = end.map(|end| parse_datetime(end, zone)).transpose()?;

    let proposal = Proposal::new(window, kind, cursor::encode(&start), force)?;
    Ok(match end {
        Some(end) => proposal.with_end(end),
        None => proposal,
    })
}

/// `cursor relative`: now minus `hours`.
pub fn propose_relative(window: &Window, kind: RecordKind, hours: i64) -> Result<Proposal> {
    if hours < 0 {
        return Err(Error::Validation(format!("--hours must not be negative, got {hours}")));
    }
    let cursor = cursor::relative(window.now(), hours).ok_or_else(|| {
        Error::Validation(format!("--hours {hours} reaches past the earliest representable cursor"))
    })?;
    Proposal::new(window, kind, cursor, false)
}

/// `cursor raw`: a literal token, stored verbatim once it decodes.
pub fn propose_raw(window: &Window, kind: RecordKind, token: &str, force: bool) -> Result<Proposal> {
    let token = token.trim();
    if token.len() < MIN_TOKEN_LEN {
        return Err(Error::Validation(format!(
            "token '{token}' is shorter than {MIN_TOKEN_LEN} characters"
        )));
    }
    if cursor::decode(token).is_none() {
        return Err(Error::Validation(format!(
            "token '{token}' does not start with a valid YYYYMMDDHHMMSS timestamp"
        )));
    }
    Proposal::new(window, kind, Cursor::new(token), force)
}

pub async fn apply(store: &dyn CursorStore, proposal: &Proposal) -> Result<()> {
    if !proposal.kind.is_incremental() {
        return Err(Error::Validation(format!(
            "{} has no cursor slot",
            proposal.kind
        )));
    }
    store.save(proposal.kind, &proposal.cursor).await?;
    info!(
        kind = %proposal.kind,
        cursor = %proposal.cursor,
        slot = %store.location(proposal.kind),
        "Cursor overridden by operator"
    );
    Ok(())
}
