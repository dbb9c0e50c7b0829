//! List/find query builder for the files table.
//!
//! Pages are cut from a `ranked_scores` CTE that numbers the filtered rows
//! with `ROW_NUMBER() OVER (ORDER BY ...)`; page `n` is the rows whose rank
//! lies in `((n - 1) * limit, n * limit]`.

use time::OffsetDateTime;
use uuid::Uuid;

/// SQL flavour of the target store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

/// A bound query argument.
#[derive(Clone, Debug, PartialEq)]
pub enum Arg {
    Int(i64),
    Text(String),
    Uuid(Uuid),
    Time(OffsetDateTime),
}

/// Sort column.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortBy {
    #[default]
    Name,
    UpdatedAt,
    Size,
    Id,
}

impl SortBy {
    fn column(&self) -> &'static str {
        match self {
            SortBy::Name => "f.name",
            SortBy::UpdatedAt => "f.updated_at",
            SortBy::Size => "f.size",
            SortBy::Id => "f.id",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "name" => Some(SortBy::Name),
            "updatedAt" | "updated_at" => Some(SortBy::UpdatedAt),
            "size" => Some(SortBy::Size),
            "id" => Some(SortBy::Id),
            _ => None,
        }
    }
}

/// Timestamp filter on `updated_at`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeFilter {
    Before(OffsetDateTime),
    After(OffsetDateTime),
}

/// Filters and paging for a file listing.
#[derive(Clone, Debug)]
pub struct FileQuery {
    pub user_id: i64,
    /// `Some(None)` lists the root; `None` searches every folder.
    pub parent_id: Option<Option<Uuid>>,
    pub file_type: Option<String>,
    pub categories: Vec<String>,
    pub mime_type: Option<String>,
    /// Case-insensitive substring match on the name.
    pub name: Option<String>,
    pub updated: Vec<TimeFilter>,
    pub sort: SortBy,
    pub descending: bool,
    /// 1-based.
    pub page: u32,
    pub limit: u32,
}

impl FileQuery {
    pub const DEFAULT_LIMIT: u32 = 500;
    pub const MAX_LIMIT: u32 = 1000;

    /// Active children of `parent_id` in the default order.
    pub fn children(user_id: i64, parent_id: Option<Uuid>) -> Self {
        Self {
            user_id,
            parent_id: Some(parent_id),
            file_type: None,
            categories: Vec::new(),
            mime_type: None,
            name: None,
            updated: Vec::new(),
            sort: SortBy::Name,
            descending: false,
            page: 1,
            limit: Self::DEFAULT_LIMIT,
        }
    }

    fn offset(&self) -> u64 {
        u64::from(self.page.max(1) - 1) * u64::from(self.limit())
    }

    fn limit(&self) -> u32 {
        self.limit.clamp(1, Self::MAX_LIMIT)
    }

    /// Build the page and count statements.
    pub fn build(&self, dialect: Dialect) -> BuiltQuery {
        let mut w = WhereBuilder::new(dialect);
        w.push("f.status = 'active'", None);
        w.push("f.user_id = {}", Some(Arg::Int(self.user_id)));
        match self.parent_id {
            Some(Some(parent)) => w.push("f.parent_id = {}", Some(Arg::Uuid(parent))),
            Some(None) => w.push("f.parent_id IS NULL", None),
            None => {}
        }
        if let Some(file_type) = &self.file_type {
            w.push("f.type = {}", Some(Arg::Text(file_type.clone())));
        }
        if !self.categories.is_empty() {
            let marks: Vec<String> = self
                .categories
                .iter()
                .map(|c| w.bind(Arg::Text(c.clone())))
                .collect();
            w.clauses.push(format!("f.category IN ({})", marks.join(", ")));
        }
        if let Some(mime) = &self.mime_type {
            w.push("f.mime_type = {}", Some(Arg::Text(mime.clone())));
        }
        if let Some(name) = &self.name {
            let pattern = format!("%{}%", escape_like(name));
            let op = match dialect {
                Dialect::Sqlite => "f.name LIKE {} ESCAPE '\\'",
                Dialect::Postgres => "f.name ILIKE {} ESCAPE '\\'",
            };
            w.push(op, Some(Arg::Text(pattern)));
        }
        for filter in &self.updated {
            match filter {
                TimeFilter::Before(t) => w.push("f.updated_at < {}", Some(Arg::Time(*t))),
                TimeFilter::After(t) => w.push("f.updated_at > {}", Some(Arg::Time(*t))),
            }
        }

        let direction = if self.descending { "DESC" } else { "ASC" };
        let where_sql = w.clauses.join(" AND ");
        let sql = format!(
            "WITH ranked_scores AS (\
             SELECT f.*, ROW_NUMBER() OVER (ORDER BY f.type DESC, {col} {direction}, f.id {direction}) AS rank \
             FROM files f WHERE {where_sql}) \
             SELECT * FROM ranked_scores WHERE rank > {lo} AND rank <= {hi} ORDER BY rank",
            col = self.sort.column(),
            lo = self.offset(),
            hi = self.offset() + u64::from(self.limit()),
        );
        let count_sql = format!("SELECT COUNT(*) FROM files f WHERE {where_sql}");
        BuiltQuery {
            sql,
            count_sql,
            args: w.args,
        }
    }
}

/// Rendered statements and their arguments.
#[derive(Clone, Debug)]
pub struct BuiltQuery {
    pub sql: String,
    pub count_sql: String,
    pub args: Vec<Arg>,
}

struct WhereBuilder {
    dialect: Dialect,
    clauses: Vec<String>,
    args: Vec<Arg>,
}

impl WhereBuilder {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            clauses: Vec::new(),
            args: Vec::new(),
        }
    }

    fn bind(&mut self, arg: Arg) -> String {
        self.args.push(arg);
        match self.dialect {
            Dialect::Sqlite => "?".to_string(),
            Dialect::Postgres => format!("${}", self.args.len()),
        }
    }

    fn push(&mut self, template: &str, arg: Option<Arg>) {
        let clause = match arg {
            Some(arg) => {
                let mark = self.bind(arg);
                template.replacen("{}", &mark, 1)
            }
            None => template.to_string(),
        };
        self.clauses.push(clause);
    }
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
