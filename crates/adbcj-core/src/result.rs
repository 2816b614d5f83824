//! Query results: streamed events, accumulated result sets, update counts.

use std::collections::HashMap;
use std::ops::Index;
use std::sync::Arc;

use crate::error::DbError;
use crate::field::Field;
use crate::value::Value;

/// Callbacks driven as protocol messages for one query arrive.
///
/// The accumulator travels with the request; the future's value is the
/// accumulator once `end_results` has run. Every callback has a no-op
/// default so handlers implement only what they observe.
pub trait ResultEventHandler<T>: Send {
    fn start_fields(&self, _accumulator: &mut T) {}
    fn field(&self, _field: Field, _accumulator: &mut T) {}
    fn end_fields(&self, _accumulator: &mut T) {}
    fn start_results(&self, _accumulator: &mut T) {}
    fn start_row(&self, _accumulator: &mut T) {}
    fn value(&self, _value: Value, _accumulator: &mut T) {}
    fn end_row(&self, _accumulator: &mut T) {}
    fn end_results(&self, _accumulator: &mut T) {}
    fn exception(&self, _error: &DbError, _accumulator: &mut T) {}
}

/// Column metadata shared by every row of one result set.
#[derive(Debug, Clone, Default)]
pub struct ColumnSet {
    fields: Vec<Field>,
    by_name: HashMap<String, usize>,
}

impl ColumnSet {
    pub fn new(fields: Vec<Field>) -> Self {
        let by_name = fields
            .iter()
            .map(|f| (f.name.clone(), f.index))
            .collect();
        Self { fields, by_name }
    }

    fn push(&mut self, field: Field) {
        self.by_name.insert(field.name.clone(), field.index);
        self.fields.push(field);
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }
}

/// One row of a result set. Column metadata is shared across all rows of
/// the same query through an `Arc`.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<ColumnSet>,
    values: Vec<Value>,
}

impl Row {
    pub fn with_columns(columns: Arc<ColumnSet>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value at a column index.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Value under a column name.
    pub fn get_named(&self, name: &str) -> Option<&Value> {
        self.columns.index_of(name).and_then(|i| self.values.get(i))
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

impl Index<usize> for Row {
    type Output = Value;

    fn index(&self, index: usize) -> &Value {
        &self.values[index]
    }
}

/// An accumulated query result: field descriptors plus rows.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    columns: Arc<ColumnSet>,
    rows: Vec<Row>,
}

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field descriptor. Only meaningful before the first row
    /// arrives; rows created afterwards share the completed column set.
    pub fn push_field(&mut self, field: Field) {
        Arc::make_mut(&mut self.columns).push(field);
    }

    /// Begin accumulating a new row.
    pub fn start_row(&mut self) {
        let width = self.columns.len();
        self.rows
            .push(Row::with_columns(Arc::clone(&self.columns), Vec::with_capacity(width)));
    }

    /// Append a value to the row most recently started.
    pub fn push_value(&mut self, value: Value) {
        if let Some(row) = self.rows.last_mut() {
            row.values.push(value);
        }
    }

    pub fn fields(&self) -> &[Field] {
        self.columns.fields()
    }

    pub fn columns(&self) -> &Arc<ColumnSet> {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }
}

impl Index<usize> for ResultSet {
    type Output = Row;

    fn index(&self, index: usize) -> &Row {
        &self.rows[index]
    }
}

/// Result of a data-modifying statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateResult {
    /// Rows affected by the statement
    pub affected_rows: u64,
    /// Generated key, when the server reported one (MySQL insert id)
    pub insert_id: Option<u64>,
    /// Warning messages attached to the completion
    pub warnings: Vec<String>,
}

impl UpdateResult {
    pub fn new(affected_rows: u64) -> Self {
        Self {
            affected_rows,
            insert_id: None,
            warnings: Vec::new(),
        }
    }
}

/// The handler behind the plain `execute_query(sql)` surface: accretes
/// fields and rows into a [`ResultSet`].
pub struct ResultSetHandler;

impl ResultEventHandler<ResultSet> for ResultSetHandler {
    fn field(&self, field: Field, accumulator: &mut ResultSet) {
        accumulator.push_field(field);
    }

    fn start_row(&self, accumulator: &mut ResultSet) {
        accumulator.start_row();
    }

    fn value(&self, value: Value, accumulator: &mut ResultSet) {
        accumulator.push_value(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SqlType;

    fn sample() -> ResultSet {
        let handler = ResultSetHandler;
        let mut acc = ResultSet::new();
        handler.start_fields(&mut acc);
        handler.field(Field::new(0, "id", SqlType::Integer), &mut acc);
        handler.field(Field::new(1, "name", SqlType::Varchar), &mut acc);
        handler.end_fields(&mut acc);
        handler.start_results(&mut acc);
        handler.start_row(&mut acc);
        handler.value(Value::Int(1), &mut acc);
        handler.value(Value::Text("ada".into()), &mut acc);
        handler.end_row(&mut acc);
        handler.start_row(&mut acc);
        handler.value(Value::Int(2), &mut acc);
        handler.value(Value::Null, &mut acc);
        handler.end_row(&mut acc);
        handler.end_results(&mut acc);
        acc
    }

    #[test]
    fn test_accumulated_result_set() {
        let rs = sample();
        assert_eq!(rs.len(), 2);
        assert_eq!(rs.fields().len(), 2);
        assert_eq!(rs[0][0], Value::Int(1));
        assert_eq!(rs[0][1], Value::Text("ada".into()));
        assert!(rs[1][1].is_null());
    }

    #[test]
    fn test_row_lookup_by_name() {
        let rs = sample();
        assert_eq!(rs[0].get_named("name"), Some(&Value::Text("ada".into())));
        assert_eq!(rs[1].get_named("id"), Some(&Value::Int(2)));
        assert_eq!(rs[0].get_named("missing"), None);
    }

    #[test]
    fn test_rows_share_columns() {
        let rs = sample();
        assert!(Arc::ptr_eq(&rs[0].columns, &rs[1].columns));
    }

    #[test]
    fn test_update_result() {
        let result = UpdateResult::new(3);
        assert_eq!(result.affected_rows, 3);
        assert_eq!(result.insert_id, None);
        assert!(result.warnings.is_empty());
    }
}
