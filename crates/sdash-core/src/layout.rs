//! Fixed-width column layouts shared by the command bindings and the parsers.
//!
//! The scheduler tools are asked to print each field padded to a declared
//! width, so a record can be recovered by character offsets alone even when a
//! value contains spaces.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub width: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnLayout {
    columns: Vec<Column>,
    separator: usize,
}

impl ColumnLayout {
    pub fn new(columns: &[(&'static str, usize)], separator: usize) -> Self {
        Self {
            columns: columns
                .iter()
                .map(|(name, width)| Column {
                    name: *name,
                    width: *width,
                })
                .collect(),
            separator,
        }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }

    /// `(start, end)` character offsets of every column.
    pub fn offsets(&self) -> Vec<(usize, usize)> {
        let mut start = 0;
        self.columns
            .iter()
            .map(|column| {
                let span = (start, start + column.width);
                start += column.width + self.separator;
                span
            })
            .collect()
    }

    pub fn line_width(&self) -> usize {
        self.offsets().last().map(|(_, end)| *end).unwrap_or(0)
    }

    /// Splits one line into trimmed field values. Lines shorter than the
    /// layout produce empty strings for the missing trailing fields.
    pub fn split(&self, line: &str) -> Vec<String> {
        let chars: Vec<char> = line.chars().collect();
        self.offsets()
            .into_iter()
            .map(|(start, end)| {
                if start >= chars.len() {
                    return String::new();
                }
                let end = end.min(chars.len());
                chars[start..end]
                    .iter()
                    .collect::<String>()
                    .trim()
                    .to_string()
            })
            .collect()
    }

    pub fn split_record<'a>(&'a self, line: &str) -> LayoutRecord<'a> {
        LayoutRecord {
            layout: self,
            values: self.split(line),
        }
    }

    /// Pads or truncates each value to its column width. Missing values
    /// render as blanks.
    pub fn render(&self, values: &[&str]) -> String {
        let gap = " ".repeat(self.separator);
        let mut line = String::with_capacity(self.line_width());
        for (idx, column) in self.columns.iter().enumerate() {
            if idx > 0 {
                line.push_str(&gap);
            }
            let value = values.get(idx).copied().unwrap_or("");
            let clipped: String = value.chars().take(column.width).collect();
            let pad = column.width - clipped.chars().count();
            line.push_str(&clipped);
            line.push_str(&" ".repeat(pad));
        }
        line
    }

    /// Field list in the `name<joiner>width` form the tools accept, e.g.
    /// `JobID:20,Name:30` for squeue or `JobID%20,JobName%30` for sacct.
    pub fn field_spec(&self, joiner: char) -> String {
        self.columns
            .iter()
            .map(|column| format!("{}{joiner}{}", column.name, column.width))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// One split line with by-name access.
#[derive(Debug, Clone)]
pub struct LayoutRecord<'a> {
    layout: &'a ColumnLayout,
    values: Vec<String>,
}

impl<'a> LayoutRecord<'a> {
    pub fn get(&self, name: &str) -> &str {
        self.layout
            .index_of(name)
            .and_then(|idx| self.values.get(idx))
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }
}
