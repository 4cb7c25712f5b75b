//! Warden script: the language generated code is written in.
//!
//! A deliberately small, JSON-valued language. It has no I/O of its own;
//! the only way out of a running script is a tool call, and every tool
//! call is routed through the runtime guard.
//!
//! ```text
//! let lead = salesforce.read.getLead({recordId: "00Q000000000000AAA"});
//! if lead.Status == "Open" {
//!     salesforce.write.updateRecord({recordId: lead.Id, Status: "Qualified"});
//! }
//! return lead.Id;
//! ```

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod value;

pub use ast::{BinOp, CallTarget, Expr, Program, Stmt, UnaryOp};
pub use parser::{parse_predicate, parse_program, BUILTINS};
