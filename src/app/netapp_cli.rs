//! Interactive sender: every line read selects a Class of Service and sends
//! a hosting request for it.

use crate::core::protocol::ProtocolNode;
use crate::domain::cos::{CosCatalog, DEFAULT_COS_ID};
use crate::domain::model::Mode;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;

pub const APP_DATA: &[u8] = b"data + program";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice {
    Send(u32),
    Invalid,
    Unknown(u32),
}

/// 空白輸入代表預設 CoS
pub fn parse_choice(line: &str, catalog: &CosCatalog) -> Choice {
    let line = line.trim();
    let cos_id = if line.is_empty() {
        DEFAULT_COS_ID
    } else {
        match line.parse::<u32>() {
            Ok(id) => id,
            Err(_) => return Choice::Invalid,
        }
    };
    if catalog.contains(cos_id) {
        Choice::Send(cos_id)
    } else {
        Choice::Unknown(cos_id)
    }
}

pub fn render_result(result: &Option<Vec<u8>>) -> String {
    match result {
        Some(bytes) => format!("b'{}'", String::from_utf8_lossy(bytes)),
        None => "None".to_string(),
    }
}

/// Reads choices from `input` until EOF or cancellation.
pub async fn run<R>(node: Arc<ProtocolNode>, mode: Mode, input: R, cancel: CancellationToken)
where
    R: AsyncBufRead + Unpin,
{
    let catalog = node.catalog().clone();

    println!("\nChoose a Class of Service and click ENTER to send a request");
    if mode == Mode::Resource {
        println!("Or wait to receive requests");
    }
    println!("\n{}", catalog.listing());
    println!("{}", node.resources().report());

    let mut lines = input.lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!("Unable to read input: {}", e);
                break;
            }
        };

        match parse_choice(&line, &catalog) {
            Choice::Invalid => {
                println!("Invalid CoS ID");
                println!("\n{}", catalog.listing());
            }
            Choice::Unknown(_) => {
                println!("This CoS doesn't exist");
                println!("\n{}", catalog.listing());
            }
            Choice::Send(cos_id) => {
                let node = node.clone();
                let listing = catalog.listing();
                tokio::spawn(async move {
                    match node.send_request(cos_id, APP_DATA.to_vec()).await {
                        Ok(result) => println!("{}", render_result(&result)),
                        Err(e) => println!("{}", e.user_friendly_message()),
                    }
                    println!("\n{}", listing);
                });
            }
        }
    }
    tracing::debug!("Interactive sender stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_choice() {
        let catalog = CosCatalog::builtin();
        assert_eq!(parse_choice("", &catalog), Choice::Send(1));
        assert_eq!(parse_choice("3\n", &catalog), Choice::Send(3));
        assert_eq!(parse_choice("abc", &catalog), Choice::Invalid);
        assert_eq!(parse_choice("-1", &catalog), Choice::Invalid);
        assert_eq!(parse_choice("42", &catalog), Choice::Unknown(42));
    }

    #[test]
    fn test_render_result() {
        assert_eq!(render_result(&Some(b"result".to_vec())), "b'result'");
        assert_eq!(render_result(&None), "None");
    }
}
