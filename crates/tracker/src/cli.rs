#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Discovery,
    Scoring,
    Smartwallets,
    Consensus,
    TrackingLive {
        balance_only: bool,
        transactions_only: bool,
        min_usd: Option<f64>,
        hours_lookback: Option<i64>,
    },
    Backtest,
    Scheduler,
}

pub const USAGE: &str = "usage: tracker <command>
commands:
  discovery       register seed wallets and extract their history
  scoring         rebuild analytics (FIFO) and qualify wallets
  smartwallets    tier analysis and optimal-threshold election
  consensus       detect consensus buys and emit alerts
  tracking-live   diff smart-wallet balances and rebuild changed tokens
      [--balance-only | --transactions-only] [--min-usd N] [--hours-lookback H]
  backtest        entry-vs-now performance of stored signals
  scheduler       run all stages on their intervals";

pub fn parse_args<I>(mut args: I) -> std::result::Result<Command, String>
where
    I: Iterator<Item = String>,
{
    // Drop argv[0].
    let _ = args.next();

    let Some(cmd) = args.next() else {
        return Err(USAGE.to_string());
    };

    match cmd.as_str() {
        "discovery" => Ok(Command::Discovery),
        "scoring" => Ok(Command::Scoring),
        "smartwallets" => Ok(Command::Smartwallets),
        "consensus" => Ok(Command::Consensus),
        "backtest" => Ok(Command::Backtest),
        "scheduler" => Ok(Command::Scheduler),
        "tracking-live" => {
            let mut balance_only = false;
            let mut transactions_only = false;
            let mut min_usd = None;
            let mut hours_lookback = None;

            while let Some(flag) = args.next() {
                match flag.as_str() {
                    "--balance-only" => balance_only = true,
                    "--transactions-only" => transactions_only = true,
                    "--min-usd" => {
                        let v = args
                            .next()
                            .ok_or_else(|| "--min-usd requires a value".to_string())?;
                        min_usd = Some(
                            v.parse::<f64>()
                                .map_err(|_| format!("invalid --min-usd value: {v}"))?,
                        );
                    }
                    "--hours-lookback" => {
                        let v = args
                            .next()
                            .ok_or_else(|| "--hours-lookback requires a value".to_string())?;
                        hours_lookback = Some(
                            v.parse::<i64>()
                                .map_err(|_| format!("invalid --hours-lookback value: {v}"))?,
                        );
                    }
                    other => return Err(format!("unknown tracking-live flag: {other}")),
                }
            }
            if balance_only && transactions_only {
                return Err("--balance-only and --transactions-only are mutually exclusive"
                    .to_string());
            }
            Ok(Command::TrackingLive {
                balance_only,
                transactions_only,
                min_usd,
                hours_lookback,
            })
        }
        other => Err(format!("unknown command: {other}\n{USAGE}")),
    }
}
