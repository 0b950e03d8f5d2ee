//! Condition evaluation against raw row images.

use crate::catalog::ColumnMeta;
use crate::errors::{Error, Result};
use crate::types::{compare_raw, value_raw, ColType, Condition, Rhs};

pub(crate) fn find_col<'a>(cols: &'a [ColumnMeta], name: &str) -> Result<&'a ColumnMeta> {
    cols.iter()
        .find(|c| c.name == name)
        .ok_or_else(|| Error::ColumnNotFound(name.to_string()))
}

fn check_condition(cols: &[ColumnMeta], rec: &[u8], cond: &Condition) -> Result<bool> {
    let lhs = find_col(cols, &cond.lhs_col)?;
    let lhs_bytes = &rec[lhs.offset as usize..(lhs.offset + lhs.len) as usize];

    let ord = match &cond.rhs {
        Rhs::Value(value) => {
            let raw = value_raw(value, lhs.col_type, lhs.len as usize)?;
            compare_raw(lhs_bytes, &raw, lhs.col_type, lhs.len as usize)
        }
        Rhs::Column(name) => {
            let rhs = find_col(cols, name)?;
            if rhs.col_type != lhs.col_type {
                return Err(Error::IncompatibleType {
                    expected: lhs.col_type,
                    given: rhs.col_type,
                });
            }
            let rhs_bytes = &rec[rhs.offset as usize..(rhs.offset + rhs.len) as usize];
            let len = match lhs.col_type {
                ColType::Str => lhs.len.min(rhs.len) as usize,
                _ => 4,
            };
            compare_raw(lhs_bytes, rhs_bytes, lhs.col_type, len)
        }
    };
    Ok(cond.op.matches(ord))
}

/// AND of all conditions.
pub(crate) fn check_conditions(
    cols: &[ColumnMeta],
    rec: &[u8],
    conds: &[Condition],
) -> Result<bool> {
    for cond in conds {
        if !check_condition(cols, rec, cond)? {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CompOp, Value};

    fn cols() -> Vec<ColumnMeta> {
        vec![
            ColumnMeta {
                table: "t".into(),
                name: "a".into(),
                col_type: ColType::Int,
                len: 4,
                offset: 0,
            },
            ColumnMeta {
                table: "t".into(),
                name: "b".into(),
                col_type: ColType::Int,
                len: 4,
                offset: 4,
            },
        ]
    }

    fn row(a: i32, b: i32) -> Vec<u8> {
        let mut rec = a.to_ne_bytes().to_vec();
        rec.extend_from_slice(&b.to_ne_bytes());
        rec
    }

    #[test]
    fn test_literal_comparison() {
        let cols = cols();
        let rec = row(5, 9);
        let cond = Condition::new("a", CompOp::Ge, Rhs::Value(Value::Int(5)));
        assert!(check_conditions(&cols, &rec, &[cond]).unwrap());
        let cond = Condition::new("a", CompOp::Gt, Rhs::Value(Value::Int(5)));
        assert!(!check_conditions(&cols, &rec, &[cond]).unwrap());
    }

    #[test]
    fn test_column_to_column_comparison() {
        let cols = cols();
        let cond = Condition::new("a", CompOp::Lt, Rhs::Column("b".into()));
        assert!(check_conditions(&cols, &row(1, 2), &[cond.clone()]).unwrap());
        assert!(!check_conditions(&cols, &row(3, 2), &[cond]).unwrap());
    }

    #[test]
    fn test_unknown_column_is_error() {
        let cond = Condition::new("zz", CompOp::Eq, Rhs::Value(Value::Int(0)));
        assert!(matches!(
            check_conditions(&cols(), &row(0, 0), &[cond]),
            Err(Error::ColumnNotFound(_))
        ));
    }

    #[test]
    fn test_conjunction() {
        let cols = cols();
        let conds = vec![
            Condition::new("a", CompOp::Eq, Rhs::Value(Value::Int(1))),
            Condition::new("b", CompOp::Ne, Rhs::Value(Value::Int(1))),
        ];
        assert!(check_conditions(&cols, &row(1, 2), &conds).unwrap());
        assert!(!check_conditions(&cols, &row(1, 1), &conds).unwrap());
    }
}
