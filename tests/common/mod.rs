//! Hand-written entities shared by the integration tests.
//!
//! `Author` has many `Book`s; a `Book` optionally belongs to an `Author`.

#![allow(dead_code)]

use rowkeeper::mock::MockConnection;
use rowkeeper::prelude::*;
use rowkeeper::{create_children, Database};
use std::sync::Arc;
use uuid::Uuid;

const AUTHOR_BOOKS_META: RelationMeta = RelationMeta {
    name: "books",
    local_field: "id",
    target_entity: "Book",
    target_field: "author_id",
    cardinality: Cardinality::Many,
    optional: false,
};

const BOOK_AUTHOR_META: RelationMeta = RelationMeta {
    name: "author",
    local_field: "author_id",
    target_entity: "Author",
    target_field: "id",
    cardinality: Cardinality::One,
    optional: true,
};

pub static AUTHOR: EntityMeta = EntityMeta {
    name: "Author",
    table: "authors",
    fields: &[
        FieldMeta::new("id", "id", FieldType::BigInt).flags(FieldFlags::SERIAL_KEY),
        FieldMeta::new("name", "name", FieldType::Text),
        FieldMeta::new("email", "email_address", FieldType::Text),
        FieldMeta::new("bio", "bio", FieldType::Text).nullable(),
    ],
    relations: &[AUTHOR_BOOKS_META],
    default_order: &[],
};

pub static BOOK: EntityMeta = EntityMeta {
    name: "Book",
    table: "books",
    fields: &[
        FieldMeta::new("id", "id", FieldType::Uuid).flags(FieldFlags::KEY),
        FieldMeta::new("author_id", "author_id", FieldType::BigInt).nullable(),
        FieldMeta::new("title", "title", FieldType::Text),
        FieldMeta::new("pages", "pages", FieldType::Int),
    ],
    relations: &[BOOK_AUTHOR_META],
    default_order: &[("title", SortDirection::Asc)],
};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Author {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub bio: Option<String>,
    pub books: Option<Vec<Book>>,
}

impl Author {
    pub fn new(name: &str, email: &str) -> Self {
        Self {
            name: name.to_string(),
            email: email.to_string(),
            ..Self::default()
        }
    }
}

impl Entity for Author {
    fn meta() -> &'static EntityMeta {
        &AUTHOR
    }

    fn from_record(record: &Record) -> Result<Self> {
        Ok(Self {
            id: record.try_get("id")?,
            name: record.try_get("name")?,
            email: record.try_get("email_address")?,
            bio: record.try_get_opt("bio")?,
            books: None,
        })
    }

    fn get(&self, field: &str) -> Option<Value> {
        match field {
            "id" => Some(Value::from(self.id)),
            "name" => Some(Value::from(self.name.clone())),
            "email" => Some(Value::from(self.email.clone())),
            "bio" => Some(Value::from(self.bio.clone())),
            _ => None,
        }
    }

    fn set(&mut self, field: &str, value: Value) -> Result<()> {
        match field {
            "id" => self.id = take(field, value)?,
            "name" => self.name = take(field, value)?,
            "email" => self.email = take(field, value)?,
            "bio" => self.bio = take_opt(field, value)?,
            other => return Err(StoreError::query_build(format!("unknown field {other}"))),
        }
        Ok(())
    }

    fn create_relations(
        db: &Arc<Database>,
        ctx: &Context,
        source: &mut Self,
        created: &mut Self,
    ) -> Result<()> {
        create_children::<AuthorBooks>(db, ctx, source, created)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Book {
    pub id: Option<Uuid>,
    pub author_id: Option<i64>,
    pub title: String,
    pub pages: i32,
    pub author: Option<Box<Author>>,
}

impl Book {
    pub fn new(title: &str, pages: i32) -> Self {
        Self {
            title: title.to_string(),
            pages,
            ..Self::default()
        }
    }
}

impl Entity for Book {
    fn meta() -> &'static EntityMeta {
        &BOOK
    }

    fn from_record(record: &Record) -> Result<Self> {
        Ok(Self {
            id: record.try_get_opt("id")?,
            author_id: record.try_get_opt("author_id")?,
            title: record.try_get("title")?,
            pages: record.try_get("pages")?,
            author: None,
        })
    }

    fn get(&self, field: &str) -> Option<Value> {
        match field {
            "id" => Some(Value::from(self.id)),
            "author_id" => Some(Value::from(self.author_id)),
            "title" => Some(Value::from(self.title.clone())),
            "pages" => Some(Value::from(self.pages)),
            _ => None,
        }
    }

    fn set(&mut self, field: &str, value: Value) -> Result<()> {
        match field {
            "id" => self.id = take_opt(field, value)?,
            "author_id" => self.author_id = take_opt(field, value)?,
            "title" => self.title = take(field, value)?,
            "pages" => self.pages = take(field, value)?,
            other => return Err(StoreError::query_build(format!("unknown field {other}"))),
        }
        Ok(())
    }
}

pub struct AuthorBooks;

impl Relation for AuthorBooks {
    type Owner = Author;
    type Target = Book;

    fn meta() -> &'static RelationMeta {
        &AUTHOR.relations[0]
    }

    fn assign(owner: &mut Author, loaded: Loaded<Book>) {
        if let Loaded::Many(books) = loaded {
            owner.books = Some(books);
        }
    }

    fn take_children(owner: &mut Author) -> Vec<Book> {
        owner.books.take().unwrap_or_default()
    }
}

pub struct BookAuthor;

impl Relation for BookAuthor {
    type Owner = Book;
    type Target = Author;

    fn meta() -> &'static RelationMeta {
        &BOOK.relations[0]
    }

    fn assign(owner: &mut Book, loaded: Loaded<Author>) {
        if let Loaded::One(author) = loaded {
            owner.author = author.map(Box::new);
        }
    }
}

pub fn author_row(id: i64, name: &str, email: &str, bio: Option<&str>) -> Record {
    Record::from_pairs([
        ("id", Value::from(id)),
        ("name", Value::from(name)),
        ("email_address", Value::from(email)),
        ("bio", Value::from(bio.map(str::to_string))),
    ])
}

pub fn book_row(id: Uuid, author_id: Option<i64>, title: &str, pages: i32) -> Record {
    Record::from_pairs([
        ("id", Value::from(id)),
        ("author_id", Value::from(author_id)),
        ("title", Value::from(title)),
        ("pages", Value::from(pages)),
    ])
}

/// Database over a mock primary.
pub fn database() -> (MockConnection, Arc<Database>) {
    let mock = MockConnection::new();
    let db = Arc::new(Database::new(Arc::new(mock.clone())));
    (mock, db)
}
