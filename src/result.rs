//! Buffered query results.
//!
//! The text protocol sends every value as a string, so a [`Row`] keeps raw
//! bytes and converts on access.

use crate::protocol::{ColumnDef, ColumnType, OkPacket};

/// Column metadata from the result set header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub table: String,
    pub schema: String,
    pub column_type: ColumnType,
    /// Collation id of the column values.
    pub charset: u16,
    /// Maximum display length.
    pub length: u32,
    pub flags: u16,
    pub decimals: u8,
}

impl From<ColumnDef> for Field {
    fn from(def: ColumnDef) -> Self {
        Self {
            name: def.name,
            table: def.table,
            schema: def.schema,
            column_type: def.column_type,
            charset: def.charset,
            length: def.column_length,
            flags: def.flags,
            decimals: def.decimals,
        }
    }
}

/// One row of a result set. `None` is SQL NULL, distinct from an empty value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    values: Vec<Option<Vec<u8>>>,
}

impl Row {
    pub(crate) fn new(values: Vec<Option<Vec<u8>>>) -> Self {
        Self { values }
    }

    /// Get raw bytes of a column.
    pub fn get_bytes(&self, idx: usize) -> Option<&[u8]> {
        self.values.get(idx)?.as_deref()
    }

    /// Get a column value as &str.
    /// Returns None if the value is NULL or invalid UTF-8.
    pub fn get_str(&self, idx: usize) -> Option<&str> {
        std::str::from_utf8(self.get_bytes(idx)?).ok()
    }

    /// Get a column value as String.
    pub fn get_string(&self, idx: usize) -> Option<String> {
        self.get_str(idx).map(str::to_string)
    }

    /// Get a column value as i64.
    pub fn get_i64(&self, idx: usize) -> Option<i64> {
        self.get_str(idx)?.parse().ok()
    }

    /// Get a column value as u64.
    pub fn get_u64(&self, idx: usize) -> Option<u64> {
        self.get_str(idx)?.parse().ok()
    }

    /// Get a column value as f64.
    pub fn get_f64(&self, idx: usize) -> Option<f64> {
        self.get_str(idx)?.parse().ok()
    }

    /// Check if a column is NULL. Out-of-range indexes count as NULL.
    pub fn is_null(&self, idx: usize) -> bool {
        self.values.get(idx).map(|v| v.is_none()).unwrap_or(true)
    }

    /// Get number of columns in the row.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[Option<Vec<u8>>] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Option<Vec<u8>>> {
        self.values
    }
}

/// A fully buffered result set.
///
/// Rows are read with a single forward cursor shared by every call to
/// [`ResultSet::rows`]. The result set does not borrow the connection that
/// produced it.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    fields: Vec<Field>,
    rows: Vec<Row>,
    cursor: usize,
    affected_rows: u64,
    last_insert_id: u64,
    warnings: u16,
}

impl ResultSet {
    pub(crate) fn new(fields: Vec<Field>, rows: Vec<Row>, warnings: u16) -> Self {
        debug_assert!(rows.iter().all(|r| r.len() == fields.len()));
        Self {
            fields,
            rows,
            warnings,
            ..Self::default()
        }
    }

    /// Result of a statement that returned no rows.
    pub(crate) fn from_ok(ok: &OkPacket) -> Self {
        Self {
            affected_rows: ok.affected_rows,
            last_insert_id: ok.last_insert_id,
            warnings: ok.warnings,
            ..Self::default()
        }
    }

    /// Column names in server order.
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Index of the first column called `name`.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Number of buffered rows, regardless of the cursor position.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Iterate from the current cursor position.
    ///
    /// Rows consumed here are not seen again by a later call:
    ///
    /// ```ignore
    /// let first = rs.rows().next();
    /// let rest: Vec<_> = rs.rows().collect(); // starts at the second row
    /// ```
    pub fn rows(&mut self) -> Rows<'_> {
        Rows {
            rows: &self.rows,
            cursor: &mut self.cursor,
        }
    }

    /// Rows affected by an INSERT/UPDATE/DELETE.
    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    /// AUTO_INCREMENT value generated by the statement, or 0.
    pub fn last_insert_id(&self) -> u64 {
        self.last_insert_id
    }

    pub fn warnings(&self) -> u16 {
        self.warnings
    }

    /// Release the buffered rows. Field metadata stays available.
    pub fn dispose(&mut self) {
        self.rows = Vec::new();
        self.cursor = 0;
    }
}

/// Forward-only iterator over a [`ResultSet`].
pub struct Rows<'a> {
    rows: &'a [Row],
    cursor: &'a mut usize,
}

impl<'a> Iterator for Rows<'a> {
    type Item = &'a Row;

    fn next(&mut self) -> Option<Self::Item> {
        let row = self.rows.get(*self.cursor)?;
        *self.cursor += 1;
        Some(row)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.rows.len().saturating_sub(*self.cursor);
        (left, Some(left))
    }
}

impl ExactSizeIterator for Rows<'_> {}
