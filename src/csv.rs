use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::Amount;
use crate::model::{
    Actor, Command, PayoutMethodId, PayoutRequestId, SpendKind, TransactionId, UserId, Vault,
    VaultKind,
};

/// Errors that can occur when reading command rows or writing balances
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("failed to open {path}: {source}")]
    Open { path: String, source: csv::Error },

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized op '{op}'")]
    UnrecognizedOp { line: usize, op: String },

    #[error("line {line}: {op} missing {field}")]
    MissingField {
        line: usize,
        op: String,
        field: &'static str,
    },

    #[error("line {line}: invalid {field} '{value}'")]
    InvalidField {
        line: usize,
        field: &'static str,
        value: String,
    },

    #[error("failed to write balances: {0}")]
    Write(#[from] csv::Error),

    #[error("failed to flush balances: {0}")]
    Flush(#[from] io::Error),
}

#[derive(Debug, Deserialize)]
struct InputRow {
    op: String,
    actor: String,
    #[serde(default)]
    counterparty: Option<String>,
    #[serde(default)]
    amount: Option<i64>,
    #[serde(default)]
    reference: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

#[derive(Debug, Serialize)]
struct OutputRow<'a> {
    vault: &'a str,
    kind: VaultKind,
    available: Amount,
    locked: Amount,
    lifetime_in: Amount,
    lifetime_out: Amount,
}

/// Read ledger commands from a csv file with the header
/// `op,actor,counterparty,amount,reference,detail`
pub fn read_commands(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<Command, CsvError>>, CsvError> {
    let path = path.as_ref();
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| CsvError::Open {
            path: path.display().to_string(),
            source,
        })?;

    Ok(reader
        .into_deserialize::<InputRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            parse_row(line, row)
        }))
}

fn parse_row(line: usize, row: InputRow) -> Result<Command, CsvError> {
    let op = row.op.to_ascii_lowercase();
    let missing = |field: &'static str| CsvError::MissingField {
        line,
        op: op.clone(),
        field,
    };
    let counterparty = non_empty(row.counterparty).map(UserId::new);
    let reference = non_empty(row.reference);
    let detail = non_empty(row.detail);

    match op.as_str() {
        "purchase" => Ok(Command::Purchase {
            user: UserId::new(row.actor),
            reference: reference.ok_or_else(|| missing("reference"))?,
            amount: Amount::new(row.amount.ok_or_else(|| missing("amount"))?),
        }),
        "spend" => {
            let kind = detail.ok_or_else(|| missing("detail"))?;
            Ok(Command::Spend {
                payer: UserId::new(row.actor),
                earner: counterparty,
                amount: Amount::new(row.amount.ok_or_else(|| missing("amount"))?),
                kind: kind
                    .to_ascii_uppercase()
                    .parse::<SpendKind>()
                    .map_err(|_| CsvError::InvalidField {
                        line,
                        field: "detail",
                        value: kind,
                    })?,
                key: TransactionId::new(reference.ok_or_else(|| missing("reference"))?),
            })
        }
        "refund" | "override" => Ok(Command::Refund {
            transaction: TransactionId::new(reference.ok_or_else(|| missing("reference"))?),
            requested_by: parse_actor(line, &row.actor)?,
            reason: detail.unwrap_or_default(),
            override_window: op == "override",
        }),
        "payout" => Ok(Command::Payout {
            creator: UserId::new(row.actor),
            amount: Amount::new(row.amount.ok_or_else(|| missing("amount"))?),
            method: PayoutMethodId::new(detail.ok_or_else(|| missing("detail"))?),
            key: reference.ok_or_else(|| missing("reference"))?,
        }),
        "approve" | "reject" => {
            let creator = counterparty.ok_or_else(|| missing("counterparty"))?;
            let key = reference.ok_or_else(|| missing("reference"))?;
            Ok(Command::DecidePayout {
                request: PayoutRequestId::derive(&creator, &key),
                approve: op == "approve",
                decided_by: parse_actor(line, &row.actor)?,
            })
        }
        "released" => {
            let creator = counterparty.ok_or_else(|| missing("counterparty"))?;
            let key = reference.ok_or_else(|| missing("reference"))?;
            Ok(Command::ConfirmReleased {
                request: PayoutRequestId::derive(&creator, &key),
            })
        }
        _ => Err(CsvError::UnrecognizedOp { line, op: row.op }),
    }
}

fn non_empty(field: Option<String>) -> Option<String> {
    field.filter(|value| !value.is_empty())
}

/// `admin:<id>`, `user:<id>` and `system` parse as-is; a bare id is a user.
fn parse_actor(line: usize, actor: &str) -> Result<Actor, CsvError> {
    if !actor.contains(':') && actor != "system" {
        return Ok(Actor::User(UserId::new(actor)));
    }
    actor.parse().map_err(|_| CsvError::InvalidField {
        line,
        field: "actor",
        value: actor.to_string(),
    })
}

/// Write vault balances in csv format
pub fn write_vaults<'a>(
    vaults: impl IntoIterator<Item = &'a Vault>,
    out: impl io::Write,
) -> Result<(), CsvError> {
    let mut writer = csv::Writer::from_writer(out);

    for vault in vaults {
        writer.serialize(OutputRow {
            vault: vault.id.as_str(),
            kind: vault.kind,
            available: vault.available,
            locked: vault.locked,
            lifetime_in: vault.lifetime_in,
            lifetime_out: vault.lifetime_out,
        })?;
    }

    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VaultId;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HEADER: &str = "op,actor,counterparty,amount,reference,detail\n";

    fn write_csv(rows: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(HEADER.as_bytes()).unwrap();
        file.write_all(rows.as_bytes()).unwrap();
        file
    }

    fn read(rows: &str) -> Vec<Result<Command, CsvError>> {
        let file = write_csv(rows);
        read_commands(file.path()).unwrap().collect()
    }

    #[test]
    fn read_purchase() {
        let results = read("purchase,alice,,200,pi_abc123,\n");
        assert_eq!(results.len(), 1);
        match results.into_iter().next().unwrap().unwrap() {
            Command::Purchase {
                user,
                reference,
                amount,
            } => {
                assert_eq!(user, UserId::new("alice"));
                assert_eq!(reference, "pi_abc123");
                assert_eq!(amount, Amount::new(200));
            }
            other => panic!("expected purchase, got {other:?}"),
        }
    }

    #[test]
    fn read_spend_with_and_without_earner() {
        let results = read("spend,alice,bob,100,chat-1,chat\nspend,alice,,40,boost-1,BOOST\n");
        match results[0].as_ref().unwrap() {
            Command::Spend {
                earner, kind, key, ..
            } => {
                assert_eq!(earner.as_ref(), Some(&UserId::new("bob")));
                assert_eq!(*kind, SpendKind::Chat);
                assert_eq!(key, &TransactionId::new("chat-1"));
            }
            other => panic!("expected spend, got {other:?}"),
        }
        assert!(matches!(
            results[1].as_ref().unwrap(),
            Command::Spend {
                earner: None,
                kind: SpendKind::Boost,
                ..
            }
        ));
    }

    #[test]
    fn read_refund_actors() {
        let results = read(
            "refund,alice,,,chat-1,changed my mind\noverride,admin:ops,,,chat-1,ticket 42\n",
        );
        assert!(matches!(
            results[0].as_ref().unwrap(),
            Command::Refund {
                requested_by: Actor::User(_),
                override_window: false,
                ..
            }
        ));
        match results[1].as_ref().unwrap() {
            Command::Refund {
                requested_by,
                reason,
                override_window,
                ..
            } => {
                assert_eq!(requested_by, &Actor::Admin("ops".into()));
                assert_eq!(reason, "ticket 42");
                assert!(*override_window);
            }
            other => panic!("expected refund, got {other:?}"),
        }
    }

    #[test]
    fn read_payout_lifecycle() {
        let results = read(
            "payout,bob,,300,w1,bank-1\napprove,admin:ops,bob,,w1,\nreleased,system,bob,,w1,\n",
        );
        let id = PayoutRequestId::derive(&UserId::new("bob"), "w1");
        assert!(matches!(
            results[0].as_ref().unwrap(),
            Command::Payout { key, .. } if key == "w1"
        ));
        assert!(matches!(
            results[1].as_ref().unwrap(),
            Command::DecidePayout { request, approve: true, .. } if request == &id
        ));
        assert!(matches!(
            results[2].as_ref().unwrap(),
            Command::ConfirmReleased { request } if request == &id
        ));
    }

    #[test]
    fn read_with_whitespace() {
        let results = read("purchase, alice, , 10, pi_1, \n");
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());
    }

    #[test]
    fn read_returns_error_for_unknown_op() {
        let results = read("transfer,alice,bob,10,x,\n");
        let err = results[0].as_ref().unwrap_err();
        assert!(matches!(err, CsvError::UnrecognizedOp { line: 2, .. }));
    }

    #[test]
    fn read_returns_error_for_missing_amount() {
        let results = read("spend,alice,bob,,chat-1,chat\n");
        let err = results[0].as_ref().unwrap_err();
        assert!(matches!(
            err,
            CsvError::MissingField {
                line: 2,
                field: "amount",
                ..
            }
        ));
    }

    #[test]
    fn read_returns_error_for_bad_spend_kind() {
        let results = read("spend,alice,bob,5,k,tip\n");
        assert!(matches!(
            results[0].as_ref().unwrap_err(),
            CsvError::InvalidField { field: "detail", .. }
        ));
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(matches!(
            read_commands("/definitely/not/here.csv"),
            Err(CsvError::Open { .. })
        ));
    }

    #[test]
    fn write_vault_rows() {
        let mut vault = Vault::empty(VaultId::creator(&UserId::new("bob")));
        vault.available = Amount::new(60);
        vault.lifetime_in = Amount::new(325);
        vault.lifetime_out = Amount::new(265);

        let mut out = Vec::new();
        write_vaults([&vault], &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "vault,kind,available,locked,lifetime_in,lifetime_out\ncreator:bob,CREATOR,60,0,325,265\n"
        );
    }
}
