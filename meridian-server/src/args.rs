//! Argument-vector parsing shared by the search and scan commands.
//!
//! `SearchOptions` covers the leading option tokens
//! (CURSOR/LIMIT/SPARSE/MATCH/WHERE/NOFIELDS/FENCE/DETECT/COMMANDS plus an
//! output selector), and `AreaSpec` the trailing area form
//! (POINT/BOUNDS/OBJECT/HASH/TILE/QUADKEY/GET/ROAM). Numeric ranges accept
//! `-inf`, `+inf`, and `(x` for exclusive bounds.

use std::collections::HashSet;

use meridian_geo::{geohash, tile, BBox, Object};

use crate::error::{Result, ServerError};

/// One `WHERE field min max` clause.
#[derive(Debug, Clone)]
pub struct Where {
    pub field: String,
    pub min: f64,
    pub min_exclusive: bool,
    pub max: f64,
    pub max_exclusive: bool,
}

impl Where {
    pub fn matches(&self, value: f64) -> bool {
        if self.min_exclusive {
            if value <= self.min {
                return false;
            }
        } else if value < self.min {
            return false;
        }
        if self.max_exclusive {
            if value >= self.max {
                return false;
            }
        } else if value > self.max {
            return false;
        }
        true
    }
}

/// Output selector for search/scan replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOutput {
    Objects,
    Ids,
    Count,
    Points,
    Bounds,
    Hashes(usize),
}

/// Parsed option tokens of a search or scan command.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub key: String,
    pub cursor: u64,
    pub limit: u64,
    pub sparse: u8,
    pub glob: String,
    pub wheres: Vec<Where>,
    pub nofields: bool,
    pub fence: bool,
    pub desc: bool,
    pub detect: Option<HashSet<String>>,
    pub commands: Option<HashSet<String>>,
    pub output: SearchOutput,
}

pub const DEFAULT_LIMIT: u64 = 100;
pub const CAP_LIMIT: u64 = 100_000;

const DETECT_KINDS: [&str; 6] = ["enter", "exit", "cross", "inside", "outside", "roam"];

/// The trailing area form of a search command. GET areas are resolved
/// against the database by the caller.
#[derive(Debug, Clone)]
pub enum AreaSpec {
    /// NEARBY center + radius.
    Point { lat: f64, lon: f64, meters: f64 },
    Bounds(BBox),
    Object(Object),
    Get { key: String, id: String },
    Roam {
        key: String,
        pattern: String,
        meters: f64,
        scan: Option<String>,
    },
}

/// Cursor over an argument vector.
pub struct Args<'a> {
    args: &'a [String],
    pos: usize,
}

impl<'a> Args<'a> {
    /// Wrap the argument vector, skipping the command name.
    pub fn new(args: &'a [String]) -> Self {
        Args { args, pos: 1 }
    }

    pub fn next(&mut self) -> Result<&'a str> {
        let tok = self.args.get(self.pos).ok_or(ServerError::InvalidNumArgs)?;
        self.pos += 1;
        Ok(tok)
    }

    pub fn peek(&self) -> Option<&'a str> {
        self.args.get(self.pos).map(|s| s.as_str())
    }

    pub fn take(&mut self) -> Option<&'a str> {
        let tok = self.args.get(self.pos).map(|s| s.as_str());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    /// All remaining tokens joined by spaces (for OBJECT bodies that were
    /// tokenized by a text transport).
    pub fn rest_joined(&mut self) -> String {
        let s = self.args[self.pos..].join(" ");
        self.pos = self.args.len();
        s
    }

    pub fn finished(&self) -> bool {
        self.pos >= self.args.len()
    }

    /// Error unless every token was consumed.
    pub fn expect_end(&self) -> Result<()> {
        if self.finished() {
            Ok(())
        } else {
            Err(ServerError::InvalidNumArgs)
        }
    }

    pub fn next_f64(&mut self) -> Result<f64> {
        let tok = self.next()?;
        parse_f64(tok)
    }

    pub fn next_u64(&mut self) -> Result<u64> {
        let tok = self.next()?;
        tok.parse::<u64>()
            .map_err(|_| ServerError::invalid_argument(tok))
    }
}

pub fn parse_f64(tok: &str) -> Result<f64> {
    tok.parse::<f64>()
        .map_err(|_| ServerError::invalid_argument(tok))
}

fn parse_range_bound(tok: &str) -> Result<(f64, bool)> {
    let lower = tok.to_ascii_lowercase();
    if lower == "-inf" {
        return Ok((f64::NEG_INFINITY, false));
    }
    if lower == "+inf" || lower == "inf" {
        return Ok((f64::INFINITY, false));
    }
    if let Some(stripped) = tok.strip_prefix('(') {
        return Ok((parse_f64(stripped)?, true));
    }
    Ok((parse_f64(tok)?, false))
}

/// Parse the shared option tokens of SCAN/NEARBY/WITHIN/INTERSECTS.
///
/// Leaves the cursor at the first token of the area form (or at the end
/// for SCAN). `cmd` is the lowercased command name; SCAN rejects SPARSE
/// and FENCE.
pub fn parse_search_options(cmd: &str, args: &mut Args) -> Result<SearchOptions> {
    let key = args.next()?.to_string();
    let mut opts = SearchOptions {
        key,
        cursor: 0,
        limit: 0,
        sparse: 0,
        glob: String::new(),
        wheres: Vec::new(),
        nofields: false,
        fence: false,
        desc: false,
        detect: None,
        commands: None,
        output: SearchOutput::Objects,
    };
    let mut saw_cursor = false;
    let mut saw_limit = false;
    let mut saw_sparse = false;

    loop {
        let Some(tok) = args.peek() else { break };
        let lower = tok.to_ascii_lowercase();
        match lower.as_str() {
            "cursor" => {
                args.take();
                if saw_cursor {
                    return Err(ServerError::DuplicateArgument("CURSOR".into()));
                }
                saw_cursor = true;
                opts.cursor = args.next_u64()?;
            }
            "limit" => {
                args.take();
                if saw_limit {
                    return Err(ServerError::DuplicateArgument("LIMIT".into()));
                }
                saw_limit = true;
                opts.limit = args.next_u64()?;
                if opts.limit == 0 {
                    return Err(ServerError::invalid_argument("0"));
                }
            }
            "sparse" => {
                args.take();
                if saw_sparse {
                    return Err(ServerError::DuplicateArgument("SPARSE".into()));
                }
                saw_sparse = true;
                let n = args.next_u64()?;
                if n == 0 || n > 8 {
                    return Err(ServerError::invalid_argument(n.to_string()));
                }
                opts.sparse = n as u8;
            }
            "match" => {
                args.take();
                if !opts.glob.is_empty() {
                    return Err(ServerError::DuplicateArgument("MATCH".into()));
                }
                opts.glob = args.next()?.to_string();
            }
            "where" => {
                args.take();
                let field = args.next()?.to_string();
                let (min, min_exclusive) = parse_range_bound(args.next()?)?;
                let (max, max_exclusive) = parse_range_bound(args.next()?)?;
                opts.wheres.push(Where {
                    field,
                    min,
                    min_exclusive,
                    max,
                    max_exclusive,
                });
            }
            "nofields" => {
                args.take();
                if opts.nofields {
                    return Err(ServerError::DuplicateArgument("NOFIELDS".into()));
                }
                opts.nofields = true;
            }
            "fence" => {
                args.take();
                if opts.fence {
                    return Err(ServerError::DuplicateArgument("FENCE".into()));
                }
                opts.fence = true;
            }
            "desc" => {
                args.take();
                opts.desc = true;
            }
            "asc" => {
                args.take();
                opts.desc = false;
            }
            "detect" => {
                args.take();
                if opts.detect.is_some() {
                    return Err(ServerError::DuplicateArgument("DETECT".into()));
                }
                let vals = args.next()?;
                let mut set = HashSet::new();
                for v in vals.split(',') {
                    let v = v.to_ascii_lowercase();
                    if !DETECT_KINDS.contains(&v.as_str()) {
                        return Err(ServerError::invalid_argument(v));
                    }
                    set.insert(v);
                }
                if set.is_empty() {
                    return Err(ServerError::invalid_argument(vals));
                }
                opts.detect = Some(set);
            }
            "commands" => {
                args.take();
                if opts.commands.is_some() {
                    return Err(ServerError::DuplicateArgument("COMMANDS".into()));
                }
                let vals = args.next()?;
                let set: HashSet<String> = vals
                    .split(',')
                    .map(|v| v.to_ascii_lowercase())
                    .filter(|v| !v.is_empty())
                    .collect();
                if set.is_empty() {
                    return Err(ServerError::invalid_argument(vals));
                }
                opts.commands = Some(set);
            }
            _ => break,
        }
    }

    if cmd == "scan" {
        if opts.sparse > 0 {
            return Err(ServerError::other("SPARSE is not allowed for SCAN"));
        }
        if opts.fence {
            return Err(ServerError::other("FENCE is not allowed for SCAN"));
        }
    }
    if opts.sparse > 0 && saw_limit {
        return Err(ServerError::other("LIMIT is not allowed when SPARSE is specified"));
    }
    if opts.sparse > 0 && saw_cursor {
        return Err(ServerError::other("CURSOR is not allowed when SPARSE is specified"));
    }
    if opts.fence && saw_cursor {
        return Err(ServerError::other("CURSOR is not allowed when FENCE is specified"));
    }
    if (opts.detect.is_some() || opts.commands.is_some()) && !opts.fence {
        return Err(ServerError::other("DETECT and COMMANDS require FENCE"));
    }

    // Optional output selector.
    if let Some(tok) = args.peek() {
        let lower = tok.to_ascii_lowercase();
        let is_area_bounds = lower == "bounds"
            && cmd != "scan"
            && args
                .args
                .get(args.pos + 1)
                .map(|t| t.parse::<f64>().is_ok())
                .unwrap_or(false);
        if !is_area_bounds {
            match lower.as_str() {
                "count" => {
                    args.take();
                    opts.output = SearchOutput::Count;
                }
                "ids" => {
                    args.take();
                    opts.output = SearchOutput::Ids;
                }
                "objects" => {
                    args.take();
                    opts.output = SearchOutput::Objects;
                }
                "points" => {
                    args.take();
                    opts.output = SearchOutput::Points;
                }
                "bounds" => {
                    args.take();
                    opts.output = SearchOutput::Bounds;
                }
                "hashes" => {
                    args.take();
                    let p = args.next_u64()? as usize;
                    if p == 0 || p > geohash::MAX_PRECISION {
                        return Err(ServerError::invalid_argument(p.to_string()));
                    }
                    opts.output = SearchOutput::Hashes(p);
                }
                _ => {
                    if cmd == "scan" {
                        return Err(ServerError::invalid_argument(tok));
                    }
                }
            }
        }
    }

    if opts.limit == 0 {
        opts.limit = DEFAULT_LIMIT;
    } else if opts.limit > CAP_LIMIT {
        opts.limit = CAP_LIMIT;
    }
    if opts.sparse > 0 {
        opts.limit = u64::MAX;
    }
    Ok(opts)
}

/// Parse the trailing area form. `types` lists the forms the command
/// accepts (lowercased).
pub fn parse_area(cmd: &str, args: &mut Args, types: &[&str]) -> Result<AreaSpec> {
    let typ = args.next()?;
    let lower = typ.to_ascii_lowercase();
    if !types.contains(&lower.as_str()) {
        return Err(ServerError::invalid_argument(typ));
    }
    let area = match lower.as_str() {
        "point" => {
            let lat = args.next_f64()?;
            let lon = args.next_f64()?;
            let meters = if cmd == "nearby" { args.next_f64()? } else { 0.0 };
            AreaSpec::Point { lat, lon, meters }
        }
        "bounds" => {
            let min_lat = args.next_f64()?;
            let min_lon = args.next_f64()?;
            let max_lat = args.next_f64()?;
            let max_lon = args.next_f64()?;
            AreaSpec::Bounds(BBox::new(min_lat, min_lon, max_lat, max_lon))
        }
        "object" => {
            let body = args.rest_joined();
            if body.is_empty() {
                return Err(ServerError::InvalidNumArgs);
            }
            AreaSpec::Object(Object::from_json(&body)?)
        }
        "hash" => {
            let hash = args.next()?;
            AreaSpec::Bounds(geohash::bounds(hash)?)
        }
        "tile" => {
            let x = args.next()?;
            let x: i64 = x.parse().map_err(|_| ServerError::invalid_argument(x))?;
            let y = args.next()?;
            let y: i64 = y.parse().map_err(|_| ServerError::invalid_argument(y))?;
            let z = args.next()?;
            let z: u32 = z.parse().map_err(|_| ServerError::invalid_argument(z))?;
            AreaSpec::Bounds(tile::tile_to_bounds(x, y, z))
        }
        "quadkey" => {
            let qk = args.next()?;
            AreaSpec::Bounds(tile::quadkey_to_bounds(qk)?)
        }
        "get" => {
            let key = args.next()?.to_string();
            let id = args.next()?.to_string();
            AreaSpec::Get { key, id }
        }
        "roam" => {
            let key = args.next()?.to_string();
            let pattern = args.next()?.to_string();
            let meters = args.next_f64()?;
            let scan = match args.peek().map(|t| t.to_ascii_lowercase()) {
                Some(ref t) if t == "scan" => {
                    args.take();
                    Some(args.next()?.to_string())
                }
                _ => None,
            };
            AreaSpec::Roam {
                key,
                pattern,
                meters,
                scan,
            }
        }
        _ => return Err(ServerError::invalid_argument(typ)),
    };
    args.expect_end()?;
    Ok(area)
}
