//! Demo fuzzer: a generator for small arithmetic expressions and an
//! interpreter with hand-placed coverage probes.
//!
//! Structural draws decide the expression shape (leaf or operator, which
//! operator); value draws fill in the literals. The interpreter divides,
//! so a generated divisor of zero is the planted failure the campaign
//! should find.

use std::sync::atomic::Ordering;

use anyhow::Result;
use splitfuzz::{
    Channel, Config, CoverageSink, FailureInfo, GuidanceEngine, SplitByteSource, TrialOutcome,
};

const MAX_DEPTH: u32 = 6;

// Coverage edge ids for the interpreter's branch points.
const EDGE_LIT: u32 = 1;
const EDGE_LIT_NEGATIVE: u32 = 2;
const EDGE_OP_BASE: u32 = 10;
const EDGE_DIV_SMALL: u32 = 20;

#[derive(Debug)]
enum Expr {
    Lit(i64),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
}

/// Builds an expression from the two byte channels. `None` means the byte
/// stream ended mid-expression.
fn generate(src: &mut SplitByteSource<'_>, depth: u32) -> splitfuzz::Result<Option<Expr>> {
    let leaf = if depth >= MAX_DEPTH {
        true
    } else {
        match src.next_bool(Channel::Structure)? {
            Some(leaf) => leaf,
            None => return Ok(None),
        }
    };
    if leaf {
        let Some(raw) = src.next_u16(Channel::Value)? else {
            return Ok(None);
        };
        return Ok(Some(Expr::Lit(i64::from(raw as i16))));
    }

    let Some(op) = src.choose_index(Channel::Structure, 4)? else {
        return Ok(None);
    };
    let Some(lhs) = generate(src, depth + 1)? else {
        return Ok(None);
    };
    let Some(rhs) = generate(src, depth + 1)? else {
        return Ok(None);
    };
    let (lhs, rhs) = (Box::new(lhs), Box::new(rhs));
    Ok(Some(match op {
        0 => Expr::Add(lhs, rhs),
        1 => Expr::Sub(lhs, rhs),
        2 => Expr::Mul(lhs, rhs),
        _ => Expr::Div(lhs, rhs),
    }))
}

/// The "program under test": evaluates the expression, reporting one edge
/// per branch taken.
fn eval(expr: &Expr, sink: &CoverageSink) -> std::result::Result<i64, FailureInfo> {
    match expr {
        Expr::Lit(v) => {
            sink.record(EDGE_LIT);
            if *v < 0 {
                sink.record(EDGE_LIT_NEGATIVE);
            }
            Ok(*v)
        }
        Expr::Add(a, b) => {
            sink.record_arm(EDGE_OP_BASE, 0);
            binop(a, b, sink, "add", i64::checked_add)
        }
        Expr::Sub(a, b) => {
            sink.record_arm(EDGE_OP_BASE, 1);
            binop(a, b, sink, "sub", i64::checked_sub)
        }
        Expr::Mul(a, b) => {
            sink.record_arm(EDGE_OP_BASE, 2);
            binop(a, b, sink, "mul", i64::checked_mul)
        }
        Expr::Div(a, b) => {
            sink.record_arm(EDGE_OP_BASE, 3);
            let lhs = eval(a, sink)?;
            let rhs = eval(b, sink)?;
            if rhs.abs() < 16 {
                sink.record(EDGE_DIV_SMALL);
            }
            lhs.checked_div(rhs).ok_or_else(|| {
                FailureInfo::new(
                    "division error",
                    vec!["arith_eval::eval".into(), "Expr::Div".into()],
                )
            })
        }
    }
}

fn binop(
    a: &Expr,
    b: &Expr,
    sink: &CoverageSink,
    name: &str,
    op: fn(i64, i64) -> Option<i64>,
) -> std::result::Result<i64, FailureInfo> {
    let lhs = eval(a, sink)?;
    let rhs = eval(b, sink)?;
    op(lhs, rhs).ok_or_else(|| {
        FailureInfo::new(
            "arithmetic overflow",
            vec!["arith_eval::eval".into(), format!("Expr::{name}")],
        )
    })
}

/// Byte encoding of `Div(Lit(42), Lit(7))`: operator node (bool 0), op
/// index 3 (u32), then two literal leaves (bool 1 + u16 each).
fn division_seed() -> Vec<u8> {
    vec![
        0x00, // operator node
        0x03, 0x00, 0x00, 0x00, // op index 3: Div
        0x01, // leaf
        0x2A, 0x00, // 42
        0x01, // leaf
        0x07, 0x00, // 7
    ]
}

fn main() -> Result<()> {
    env_logger::init();

    let cfg = Config::from_env();
    let out_dir =
        std::env::var("SPLITFUZZ_OUT_DIR").unwrap_or_else(|_| "out/arith_eval".to_string());
    let mut engine = GuidanceEngine::with_output_dir(cfg, &out_dir)?;

    let stop = engine.stop_handle();
    ctrlc::set_handler(move || stop.store(true, Ordering::Relaxed))?;

    // Start from a known division so the campaign begins with a
    // non-trivial shape.
    engine.add_seed(division_seed());

    let mut harness = |source: &mut SplitByteSource<'_>, sink: &CoverageSink| {
        let expr = match generate(source, 0) {
            Ok(Some(expr)) => expr,
            Ok(None) => return TrialOutcome::Invalid,
            Err(err) => {
                log::warn!("generator consistency error: {err}");
                return TrialOutcome::Invalid;
            }
        };
        match eval(&expr, sink) {
            Ok(_) => TrialOutcome::Success,
            Err(info) => TrialOutcome::Failure(info),
        }
    };

    let report = engine.run_campaign(&mut harness)?;
    println!(
        "{} trials ({} valid, {} invalid), {} unique failures, {} inputs saved, {} edges covered",
        report.trials,
        report.valid_trials,
        report.invalid_trials,
        report.unique_failures,
        report.corpus_size,
        report.total_coverage,
    );
    println!(
        "diversity: b0 {:.1}, b1 {:.1}, b2 {:.1}",
        report.hill.b0, report.hill.b1, report.hill.b2
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn campaign_finds_the_division_failure() {
        let cfg = Config {
            rng_seed: Some(7),
            max_trials: 20_000,
            stop_on_failure: true,
            stats_refresh: Duration::from_secs(3600),
            ..Config::default()
        };
        let mut engine = GuidanceEngine::new(cfg);
        engine.add_seed(division_seed());
        let mut harness = |source: &mut SplitByteSource<'_>, sink: &CoverageSink| {
            let expr = match generate(source, 0) {
                Ok(Some(expr)) => expr,
                _ => return TrialOutcome::Invalid,
            };
            match eval(&expr, sink) {
                Ok(_) => TrialOutcome::Success,
                Err(info) => TrialOutcome::Failure(info),
            }
        };
        let report = engine.run_campaign(&mut harness).unwrap();
        assert!(report.unique_failures > 0, "report: {report:?}");
        assert!(report.corpus_size > 0);
    }
}
