mod catalog;
mod dump;
mod mysql;

pub use catalog::Catalog;
pub use dump::{DumpSource, DumpSummary, MysqlDump};
pub use mysql::MysqlCatalog;
