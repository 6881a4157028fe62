//! Relation loading.
//!
//! A [`Relation`] ties an owner entity to a target entity through a
//! [`RelationMeta`]. [`RelationLoader`] hydrates it for one owner with an
//! equality lookup, or for a whole collection with a single `IN` query
//! (`load_batch`), which is the way to avoid one query per owner.
//!
//! Strategy for a batch:
//! 1. Collect the distinct, non-null join values of all owners
//! 2. Fetch every matching target in one query
//! 3. Group targets by their join value
//! 4. Assign each owner its group by lookup

use crate::condition::Condition;
use crate::database::Database;
use crate::entity::Entity;
use crate::error::{ErrorKind, Result, StoreError};
use crate::metadata::{Cardinality, RelationMeta};
use crate::query::QueryOptions;
use crate::store::EntityStore;
use crate::transaction::Context;
use crate::value::{is_null, value_key, Record};
use sea_query::Value;
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;

/// Result of loading one relation for one owner.
#[derive(Debug, Clone, PartialEq)]
pub enum Loaded<T> {
    One(Option<T>),
    Many(Vec<T>),
}

impl<T> Loaded<T> {
    fn empty(cardinality: Cardinality) -> Self {
        match cardinality {
            Cardinality::One => Loaded::One(None),
            Cardinality::Many => Loaded::Many(Vec::new()),
        }
    }
}

/// One relation of an owner entity. Implemented by a marker type per relation.
pub trait Relation: 'static {
    type Owner: Entity;
    type Target: Entity;

    fn meta() -> &'static RelationMeta;

    /// Store the loaded value on the owner.
    fn assign(owner: &mut Self::Owner, loaded: Loaded<Self::Target>);

    /// Move nested children out of an owner about to be created.
    fn take_children(_owner: &mut Self::Owner) -> Vec<Self::Target> {
        Vec::new()
    }
}

pub struct RelationLoader<R: Relation> {
    targets: EntityStore<R::Target>,
    _relation: PhantomData<fn() -> R>,
}

impl<R: Relation> Clone for RelationLoader<R> {
    fn clone(&self) -> Self {
        Self {
            targets: self.targets.clone(),
            _relation: PhantomData,
        }
    }
}

impl<R: Relation> RelationLoader<R> {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            targets: EntityStore::new(db),
            _relation: PhantomData,
        }
    }

    fn join_value(owner: &R::Owner) -> Option<Value> {
        owner
            .get(R::meta().local_field)
            .filter(|value| !is_null(value))
    }

    /// Hydrate the relation of a single owner.
    ///
    /// An owner whose join field is unset is skipped without a query. A missing
    /// target of a to-one relation loads as `None`; when several rows match, the
    /// last one in default order wins, the same rule [`load_batch`](Self::load_batch)
    /// applies.
    pub fn load<I>(&self, ctx: &Context, owner: &mut R::Owner, filters: I) -> Result<()>
    where
        I: IntoIterator<Item = Condition>,
    {
        let meta = R::meta();
        let Some(key) = Self::join_value(owner) else {
            if meta.optional {
                log::debug!("skipping {}.{}: {} is unset", R::Owner::meta().name, meta.name, meta.local_field);
            } else {
                log::warn!("skipping {}.{}: required {} is null", R::Owner::meta().name, meta.name, meta.local_field);
            }
            R::assign(owner, Loaded::empty(meta.cardinality));
            return Ok(());
        };

        let mut conditions = vec![Condition::Eq(meta.target_field.to_string(), key)];
        conditions.extend(filters);
        let loaded = match meta.cardinality {
            Cardinality::One => Loaded::One(self.targets.find_many(ctx, conditions)?.pop()),
            Cardinality::Many => Loaded::Many(self.targets.find_many(ctx, conditions)?),
        };
        R::assign(owner, loaded);
        Ok(())
    }

    /// Like [`load`](Self::load) for callers holding an optional owner.
    pub fn load_opt<I>(&self, ctx: &Context, owner: Option<&mut R::Owner>, filters: I) -> Result<()>
    where
        I: IntoIterator<Item = Condition>,
    {
        match owner {
            Some(owner) => self.load(ctx, owner, filters),
            None => Err(StoreError::new(ErrorKind::ModelIsNil, "owner is None")
                .during("load", R::Owner::meta().name)),
        }
    }

    /// Hydrate the relation of every owner with one query.
    ///
    /// No owners, or no owner with a join value, issues no query at all.
    pub fn load_batch<I>(&self, ctx: &Context, owners: &mut [R::Owner], filters: I) -> Result<()>
    where
        I: IntoIterator<Item = Condition>,
    {
        let meta = R::meta();
        let mut keys: Vec<Value> = Vec::new();
        let mut seen = HashSet::new();
        for owner in owners.iter() {
            if let Some(key) = Self::join_value(owner) {
                if seen.insert(value_key(&key)) {
                    keys.push(key);
                }
            }
        }
        if keys.is_empty() {
            for owner in owners.iter_mut() {
                R::assign(owner, Loaded::empty(meta.cardinality));
            }
            return Ok(());
        }

        let mut conditions = vec![Condition::In(meta.target_field.to_string(), keys)];
        conditions.extend(filters);
        let targets = self.targets.find_many(ctx, conditions)?;
        log::debug!(
            "loaded {} {} rows for {} owners",
            targets.len(),
            R::Target::meta().name,
            owners.len()
        );

        let mut groups: HashMap<String, Vec<R::Target>> = HashMap::new();
        for target in targets {
            let Some(key) = target.get(meta.target_field) else {
                continue;
            };
            let group = groups.entry(value_key(&key)).or_default();
            match meta.cardinality {
                Cardinality::Many => group.push(target),
                // last seen wins
                Cardinality::One => *group = vec![target],
            }
        }

        // Owners sharing a join value each get their own copy of the group.
        let mut shared: HashMap<String, usize> = HashMap::new();
        for owner in owners.iter() {
            if let Some(key) = Self::join_value(owner) {
                *shared.entry(value_key(&key)).or_default() += 1;
            }
        }
        for owner in owners.iter_mut() {
            let group = match Self::join_value(owner) {
                Some(key) => take_group(&mut groups, &mut shared, &value_key(&key))?,
                None => None,
            };
            let loaded = match meta.cardinality {
                Cardinality::One => Loaded::One(group.and_then(|g| g.into_iter().next())),
                Cardinality::Many => Loaded::Many(group.unwrap_or_default()),
            };
            R::assign(owner, loaded);
        }
        Ok(())
    }
}

/// The last owner with a key takes the group itself, earlier ones get copies.
fn take_group<T: Entity>(
    groups: &mut HashMap<String, Vec<T>>,
    shared: &mut HashMap<String, usize>,
    key: &str,
) -> Result<Option<Vec<T>>> {
    let Some(remaining) = shared.get_mut(key) else {
        return Ok(None);
    };
    *remaining = remaining.saturating_sub(1);
    if *remaining == 0 {
        return Ok(groups.remove(key));
    }
    match groups.get(key) {
        Some(group) => group.iter().map(copy_entity).collect::<Result<Vec<_>>>().map(Some),
        None => Ok(None),
    }
}

/// Entities are not required to be `Clone`; copies go through their fields.
fn copy_entity<E: Entity>(entity: &E) -> Result<E> {
    let mut record = Record::new();
    for field in E::meta().fields {
        let value = entity.get(field.name).unwrap_or_else(|| field.ty.null());
        record.push(field.column, value);
    }
    E::from_record(&record)
}

/// Create the nested children of one relation after their parent.
///
/// Each child gets the parent's join value in its target field and is created
/// in order. The created children are assigned back onto `created`.
pub fn create_children<R: Relation>(
    db: &Arc<Database>,
    ctx: &Context,
    source: &mut R::Owner,
    created: &mut R::Owner,
) -> Result<()> {
    let meta = R::meta();
    let children = R::take_children(source);
    if children.is_empty() {
        return Ok(());
    }
    let key = created
        .get(meta.local_field)
        .filter(|value| !is_null(value))
        .ok_or_else(|| {
            StoreError::query_build(format!(
                "created {} has no value for {}",
                R::Owner::meta().name,
                meta.local_field
            ))
        })?;

    let store = EntityStore::<R::Target>::new(Arc::clone(db));
    let mut saved = Vec::with_capacity(children.len());
    for mut child in children {
        child.set(meta.target_field, key.clone())?;
        saved.push(store.create(ctx, child, QueryOptions::populate_relations())?);
    }
    let loaded = match meta.cardinality {
        Cardinality::One => Loaded::One(saved.into_iter().next()),
        Cardinality::Many => Loaded::Many(saved),
    };
    R::assign(created, loaded);
    Ok(())
}
