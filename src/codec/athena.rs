//! Athena DDL side-car builder (SPEC_FULL §A.6). Pure string building, no
//! live Athena call. Grounded on
//! `original_source/internal/schema/parquet_to_athena.go`
//! (`parquetToAthenaBuilder`).

use crate::codec::parquet::{parse_schema, LogicalKind};
use crate::config::StorageBackend;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Changes,
    Entities,
}

impl TableKind {
    fn bucket_part(self) -> &'static str {
        match self {
            TableKind::Changes => "changes",
            TableKind::Entities => "entities",
        }
    }
}

fn athena_type(kind: LogicalKind) -> &'static str {
    match kind {
        LogicalKind::PlainString => "string",
        LogicalKind::Binary => "binary",
        LogicalKind::Int32 => "int",
        LogicalKind::Date32 => "date",
        LogicalKind::Int64 => "bigint",
        LogicalKind::Int64Time => "timestamp",
        LogicalKind::Float32 => "float",
        LogicalKind::Float64 => "double",
        LogicalKind::Boolean => "boolean",
    }
}

/// Build a `CREATE EXTERNAL TABLE` DDL string for one dataset/location.
/// `changes` tables are partitioned by the dataset's configured
/// `partitioning` list; `entities` tables never are.
pub fn build_ddl(dataset: &str, backend: &StorageBackend, kind: TableKind) -> Result<String> {
    let schema_text = backend
        .parquet
        .as_ref()
        .map(|p| p.schema.as_str())
        .unwrap_or("");
    let columns = parse_schema(schema_text)?;

    let partitioning: &[String] = match kind {
        TableKind::Changes => backend
            .parquet
            .as_ref()
            .map(|p| p.partitioning.as_slice())
            .unwrap_or(&[]),
        TableKind::Entities => &[],
    };

    let table_name = format!("{dataset}_{}", kind.bucket_part());
    let bucket = backend.props.bucket.clone().unwrap_or_default();
    let location = format!("s3://{bucket}/datasets/{dataset}/{}/", kind.bucket_part());

    let mut ddl = format!("CREATE EXTERNAL TABLE `{table_name}` (\n");
    let column_lines: Vec<String> = columns
        .iter()
        .filter(|c| !partitioning.contains(&c.name))
        .map(|c| format!("  `{}` {}", c.name, athena_type(c.kind)))
        .collect();
    ddl.push_str(&column_lines.join(",\n"));
    ddl.push_str("\n)\n");

    if !partitioning.is_empty() {
        let part_lines: Vec<String> = partitioning.iter().map(|p| format!("`{p}` string")).collect();
        ddl.push_str(&format!("PARTITIONED BY ({})\n", part_lines.join(", ")));
    }

    ddl.push_str("STORED AS PARQUET\n");
    ddl.push_str(&format!("LOCATION '{location}'\n"));
    ddl.push_str("TBLPROPERTIES ('parquet.compression'='SNAPPY')");

    Ok(ddl)
}
