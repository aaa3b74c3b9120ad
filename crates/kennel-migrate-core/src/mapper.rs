//! Per-module mapping of legacy rows onto canonical entities.
//!
//! Every mapping function takes one [`LegacyRecord`] plus an explicit
//! [`MappingContext`]; nothing is read from process state. Data problems are
//! reported as [`Issue`]s and never abort mapping: a record with a broken
//! reference is still emitted so the batch keeps its shape, and the BLOCKER
//! keeps it out of a commit.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::normalize::{
    exclusive_flags, natural_cmp, normalize_email, normalize_phone, parse_cents, parse_count,
    parse_date_time, parse_flag, parse_time, split_relation, Exclusive, Flag,
};
use crate::registry::Registry;
use crate::{CheckType, Issue, LegacyRecord, MigrateError, Module, SCHEMA_VERSION};

/// Legacy primary key column shared by every module.
pub const LEGACY_ID: &str = "legacyId";

const CUSTOMER_STATUS: &[(&str, &str)] = &[
    ("aktiv", "active"),
    ("active", "active"),
    ("a", "active"),
    ("inaktiv", "inactive"),
    ("inactive", "inactive"),
    ("passiv", "inactive"),
    ("gesperrt", "blocked"),
    ("blocked", "blocked"),
];

const TRAINER_STATUS: &[(&str, &str)] = &[
    ("aktiv", "active"),
    ("active", "active"),
    ("inaktiv", "inactive"),
    ("inactive", "inactive"),
    ("ausgeschieden", "inactive"),
];

const COURSE_STATUS: &[(&str, &str)] = &[
    ("geplant", "planned"),
    ("planned", "planned"),
    ("laufend", "running"),
    ("running", "running"),
    ("beendet", "finished"),
    ("abgeschlossen", "finished"),
    ("finished", "finished"),
    ("abgesagt", "cancelled"),
    ("storniert", "cancelled"),
    ("cancelled", "cancelled"),
];

const FINANCE_KIND: &[(&str, &str)] = &[
    ("einnahme", "income"),
    ("income", "income"),
    ("ausgabe", "expense"),
    ("expense", "expense"),
];

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Lookups {
    /// Course category code to display label.
    pub course_categories: BTreeMap<String, String>,
}

/// Everything a mapping call may consult.
pub struct MappingContext<'a> {
    pub registry: &'a mut Registry,
    /// Legacy ids seen per already-mapped module, including dedup suffixes.
    pub legacy_ids: BTreeMap<Module, BTreeSet<String>>,
    pub lookups: Lookups,
    /// Fallback for `createdAt`/`updatedAt` when the legacy row has none.
    pub migrated_at: String,
}

impl<'a> MappingContext<'a> {
    #[must_use]
    pub fn new(registry: &'a mut Registry, migrated_at: impl Into<String>) -> Self {
        Self {
            registry,
            legacy_ids: BTreeMap::new(),
            lookups: Lookups::default(),
            migrated_at: migrated_at.into(),
        }
    }

    #[must_use]
    pub fn knows(&self, module: Module, legacy_id: &str) -> bool {
        self.legacy_ids.get(&module).is_some_and(|ids| ids.contains(legacy_id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EntityHeader {
    pub id: String,
    pub code: String,
    pub schema_version: u32,
    pub version: u32,
    pub created_at: String,
    pub updated_at: String,
    pub legacy_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    #[serde(flatten)]
    pub header: EntityHeader,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub street: String,
    pub zip: String,
    pub city: String,
    pub status: String,
    pub newsletter: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Dog {
    #[serde(flatten)]
    pub header: EntityHeader,
    pub name: String,
    pub breed: String,
    pub birth_date: String,
    pub owner_id: String,
    pub sex: Option<String>,
    pub neutered: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Trainer {
    #[serde(flatten)]
    pub header: EntityHeader,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub active: Option<bool>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    #[serde(flatten)]
    pub header: EntityHeader,
    pub title: String,
    pub category_code: String,
    pub category: String,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub capacity: Option<u32>,
    pub booked: Option<u32>,
    pub price_cents: Option<i64>,
    pub status: String,
    pub trainer_ids: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEntry {
    #[serde(flatten)]
    pub header: EntityHeader,
    pub title: String,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub course_id: String,
    pub customer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FinanceEntry {
    #[serde(flatten)]
    pub header: EntityHeader,
    pub customer_id: String,
    pub date: String,
    pub amount_cents: Option<i64>,
    pub kind: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MerchandiseSale {
    #[serde(flatten)]
    pub header: EntityHeader,
    pub customer_id: String,
    pub date: String,
    pub article: String,
    pub quantity: Option<u32>,
    pub price_cents: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum CanonicalEntity {
    Customer(Customer),
    Dog(Dog),
    Trainer(Trainer),
    Course(Course),
    CalendarEntry(CalendarEntry),
    FinanceEntry(FinanceEntry),
    MerchandiseSale(MerchandiseSale),
}

impl CanonicalEntity {
    #[must_use]
    pub fn module(&self) -> Module {
        match self {
            Self::Customer(_) => Module::Customers,
            Self::Dog(_) => Module::Dogs,
            Self::Trainer(_) => Module::Trainers,
            Self::Course(_) => Module::Courses,
            Self::CalendarEntry(_) => Module::Calendar,
            Self::FinanceEntry(_) => Module::Finance,
            Self::MerchandiseSale(_) => Module::Merchandise,
        }
    }

    #[must_use]
    pub fn header(&self) -> &EntityHeader {
        match self {
            Self::Customer(entity) => &entity.header,
            Self::Dog(entity) => &entity.header,
            Self::Trainer(entity) => &entity.header,
            Self::Course(entity) => &entity.header,
            Self::CalendarEntry(entity) => &entity.header,
            Self::FinanceEntry(entity) => &entity.header,
            Self::MerchandiseSale(entity) => &entity.header,
        }
    }

    /// JSON object form consumed by the validator and the snapshot writer.
    ///
    /// # Errors
    /// Returns [`MigrateError::Serialization`] when serialization fails.
    pub fn to_value(&self) -> Result<Value, MigrateError> {
        Ok(serde_json::to_value(self)?)
    }
}

#[derive(Debug, Clone)]
pub struct MappedRecord {
    pub entity: CanonicalEntity,
    pub issues: Vec<Issue>,
}

#[derive(Debug, Clone)]
pub struct ModuleBatch {
    pub module: Module,
    pub entities: Vec<CanonicalEntity>,
    pub issues: Vec<Issue>,
}

impl ModuleBatch {
    /// # Errors
    /// Returns [`MigrateError::Serialization`] when an entity cannot be encoded.
    pub fn values(&self) -> Result<Vec<Value>, MigrateError> {
        self.entities.iter().map(CanonicalEntity::to_value).collect()
    }
}

/// Issue sink bound to the entity currently being mapped.
struct Draft {
    module: Module,
    entity_id: String,
    issues: Vec<Issue>,
}

impl Draft {
    fn new(module: Module) -> Self {
        Self { module, entity_id: String::new(), issues: Vec::new() }
    }

    fn blocker(&mut self, check_type: CheckType, code: impl Into<String>, message: String) {
        self.issues.push(Issue::blocker(self.module, &self.entity_id, check_type, code, message));
    }

    fn warning(&mut self, code: &str, message: String) {
        self.issues.push(Issue::warning(
            self.module,
            &self.entity_id,
            CheckType::Mapping,
            code,
            message,
        ));
    }

    fn email(&mut self, raw: &str) -> String {
        if let Some(email) = normalize_email(raw) {
            return email;
        }
        self.warning("EMAIL_INVALID", "email has an invalid shape and was cleared".to_string());
        String::new()
    }

    fn flag(&mut self, raw: &str, field: &str) -> Flag {
        let flag = parse_flag(raw);
        if flag == Flag::Unrecognized {
            self.warning("FLAG_INVALID", format!("{field} is not a yes/no marker; left unset"));
        }
        flag
    }

    fn exclusive(&mut self, record: &LegacyRecord, first: &str, second: &str) -> Exclusive {
        let outcome = exclusive_flags(
            self.flag(field(record, first), first),
            self.flag(field(record, second), second),
        );
        if outcome == Exclusive::Ambiguous {
            self.warning(
                "FLAGS_AMBIGUOUS",
                format!("{first} and {second} are both set; value left null"),
            );
        }
        outcome
    }

    fn date(&mut self, raw: &str, field: &str) -> String {
        let parts = parse_date_time(raw);
        if parts.is_empty() && !raw.trim().is_empty() {
            self.warning("DATE_INVALID", format!("{field} is not a recognised date; cleared"));
        }
        parts.date
    }

    fn time(&mut self, raw: &str, field: &str) -> String {
        let time = parse_time(raw);
        if time.is_empty() && !raw.trim().is_empty() {
            self.warning("TIME_INVALID", format!("{field} is not a recognised time; cleared"));
        }
        time
    }

    fn count(&mut self, raw: &str, field: &str) -> Option<u32> {
        let parsed = parse_count(raw);
        if parsed.is_none() && !raw.trim().is_empty() {
            self.warning("NUMBER_INVALID", format!("{field} is not a whole number; left unset"));
        }
        parsed
    }

    fn cents(&mut self, raw: &str, field: &str) -> Option<i64> {
        let parsed = parse_cents(raw);
        if parsed.is_none() && !raw.trim().is_empty() {
            self.warning("NUMBER_INVALID", format!("{field} is not a monetary amount; left unset"));
        }
        parsed
    }

    fn status(&mut self, raw: &str, vocabulary: &[(&str, &str)], field: &str) -> String {
        let key = raw.trim().to_lowercase();
        if key.is_empty() {
            return String::new();
        }
        if let Some((_, canonical)) = vocabulary.iter().find(|(legacy, _)| *legacy == key) {
            return (*canonical).to_string();
        }
        self.warning("STATUS_UNKNOWN", format!("{field} value is not recognised; cleared"));
        String::new()
    }

    /// Resolve a legacy reference into `target` through the registry.
    fn reference(
        &mut self,
        ctx: &mut MappingContext<'_>,
        target: Module,
        field: &str,
        raw: &str,
        required: bool,
    ) -> String {
        let key = raw.trim();
        if key.is_empty() {
            if required {
                self.blocker(
                    CheckType::ForeignKey,
                    format!("{}_MISSING", target.reference_code()),
                    format!("{field} is required but the legacy reference is empty"),
                );
            }
            return String::new();
        }

        if !ctx.knows(target, key) {
            self.blocker(
                CheckType::ForeignKey,
                format!("{}_NOT_FOUND", target.reference_code()),
                format!("{field} references unknown {target} legacy id {key}"),
            );
            return String::new();
        }

        ctx.registry
            .resolve(target, key)
            .map(|resolution| resolution.entry.target_id.to_string())
            .unwrap_or_default()
    }

    fn relation_set(
        &mut self,
        ctx: &mut MappingContext<'_>,
        target: Module,
        field: &str,
        raw: &str,
    ) -> BTreeSet<String> {
        split_relation(raw)
            .iter()
            .map(|key| self.reference(ctx, target, field, key, false))
            .filter(|id| !id.is_empty())
            .collect()
    }

    fn finish(self, entity: CanonicalEntity) -> MappedRecord {
        MappedRecord { entity, issues: self.issues }
    }
}

fn field<'r>(record: &'r LegacyRecord, name: &str) -> &'r str {
    record.get(name).map_or("", |value| value.trim())
}

fn header(
    module: Module,
    record: &LegacyRecord,
    ctx: &mut MappingContext<'_>,
    draft: &mut Draft,
) -> EntityHeader {
    let legacy_id = field(record, LEGACY_ID).to_string();
    let resolution = ctx.registry.resolve(module, &legacy_id);
    let id = resolution
        .as_ref()
        .map(|resolution| resolution.entry.target_id.to_string())
        .unwrap_or_default();
    draft.entity_id.clone_from(&id);

    match resolution {
        Some(resolution) if resolution.created => draft.issues.push(Issue::info(
            module,
            &id,
            CheckType::Registry,
            "REGISTRY_NEW",
            format!("new registry entry for legacy id {legacy_id}"),
        )),
        Some(_) => {}
        None => draft.blocker(
            CheckType::Mapping,
            "LEGACY_ID_MISSING",
            "record has no legacy id and cannot be mapped to a target id".to_string(),
        ),
    }

    let code = if legacy_id.is_empty() {
        String::new()
    } else {
        format!("{}-{legacy_id}", module.code_prefix())
    };
    let created_at = parse_date_time(field(record, "createdAt"))
        .timestamp()
        .unwrap_or_else(|| ctx.migrated_at.clone());
    let updated_at =
        parse_date_time(field(record, "updatedAt")).timestamp().unwrap_or_else(|| created_at.clone());

    EntityHeader {
        id,
        code,
        schema_version: SCHEMA_VERSION,
        version: 0,
        created_at,
        updated_at,
        legacy_id,
    }
}

#[must_use]
pub fn map_customer(record: &LegacyRecord, ctx: &mut MappingContext<'_>) -> MappedRecord {
    let mut draft = Draft::new(Module::Customers);
    let header = header(Module::Customers, record, ctx, &mut draft);
    let newsletter = match draft.exclusive(record, "newsletter", "noNewsletter") {
        Exclusive::First => Some(true),
        Exclusive::Second => Some(false),
        Exclusive::Ambiguous => None,
        // Declining the opt-out without a newsletter answer keeps the subscription.
        Exclusive::Neither => Some(parse_flag(field(record, "newsletter")) != Flag::No),
        Exclusive::Unknown => parse_flag(field(record, "newsletter")).as_bool(),
    };

    let entity = Customer {
        header,
        first_name: field(record, "firstName").to_string(),
        last_name: field(record, "lastName").to_string(),
        email: draft.email(field(record, "email")),
        phone: normalize_phone(field(record, "phone")),
        street: field(record, "street").to_string(),
        zip: field(record, "zip").to_string(),
        city: field(record, "city").to_string(),
        status: draft.status(field(record, "status"), CUSTOMER_STATUS, "status"),
        newsletter,
    };
    draft.finish(CanonicalEntity::Customer(entity))
}

#[must_use]
pub fn map_dog(record: &LegacyRecord, ctx: &mut MappingContext<'_>) -> MappedRecord {
    let mut draft = Draft::new(Module::Dogs);
    let header = header(Module::Dogs, record, ctx, &mut draft);
    let owner_id = draft.reference(
        ctx,
        Module::Customers,
        "ownerId",
        field(record, "ownerLegacyId"),
        true,
    );
    let sex = match draft.exclusive(record, "male", "female") {
        Exclusive::First => Some("male".to_string()),
        Exclusive::Second => Some("female".to_string()),
        Exclusive::Neither | Exclusive::Unknown | Exclusive::Ambiguous => None,
    };
    let neutered = draft.flag(field(record, "neutered"), "neutered").as_bool();

    let entity = Dog {
        header,
        name: field(record, "name").to_string(),
        breed: field(record, "breed").to_string(),
        birth_date: draft.date(field(record, "birthDate"), "birthDate"),
        owner_id,
        sex,
        neutered,
    };
    draft.finish(CanonicalEntity::Dog(entity))
}

#[must_use]
pub fn map_trainer(record: &LegacyRecord, ctx: &mut MappingContext<'_>) -> MappedRecord {
    let mut draft = Draft::new(Module::Trainers);
    let header = header(Module::Trainers, record, ctx, &mut draft);
    let active = draft.flag(field(record, "active"), "active").as_bool();

    let entity = Trainer {
        header,
        first_name: field(record, "firstName").to_string(),
        last_name: field(record, "lastName").to_string(),
        email: draft.email(field(record, "email")),
        phone: normalize_phone(field(record, "phone")),
        active,
        status: draft.status(field(record, "status"), TRAINER_STATUS, "status"),
    };
    draft.finish(CanonicalEntity::Trainer(entity))
}

#[must_use]
pub fn map_course(record: &LegacyRecord, ctx: &mut MappingContext<'_>) -> MappedRecord {
    let mut draft = Draft::new(Module::Courses);
    let header = header(Module::Courses, record, ctx, &mut draft);
    let trainer_ids =
        draft.relation_set(ctx, Module::Trainers, "trainerIds", field(record, "trainerLegacyIds"));

    let category_code = field(record, "categoryCode").to_string();
    let category = if category_code.is_empty() {
        String::new()
    } else if let Some(label) = ctx.lookups.course_categories.get(&category_code) {
        label.clone()
    } else {
        draft.warning(
            "CATEGORY_UNKNOWN",
            format!("course category {category_code} has no label; code kept"),
        );
        category_code.clone()
    };

    let entity = Course {
        header,
        title: field(record, "title").to_string(),
        category_code,
        category,
        date: draft.date(field(record, "date"), "date"),
        start_time: draft.time(field(record, "startTime"), "startTime"),
        end_time: draft.time(field(record, "endTime"), "endTime"),
        capacity: draft.count(field(record, "capacity"), "capacity"),
        booked: draft.count(field(record, "booked"), "booked"),
        price_cents: draft.cents(field(record, "price"), "price"),
        status: draft.status(field(record, "status"), COURSE_STATUS, "status"),
        trainer_ids,
    };
    draft.finish(CanonicalEntity::Course(entity))
}

#[must_use]
pub fn map_calendar_entry(record: &LegacyRecord, ctx: &mut MappingContext<'_>) -> MappedRecord {
    let mut draft = Draft::new(Module::Calendar);
    let header = header(Module::Calendar, record, ctx, &mut draft);
    let course_id =
        draft.reference(ctx, Module::Courses, "courseId", field(record, "courseLegacyId"), false);
    let customer_id = draft.reference(
        ctx,
        Module::Customers,
        "customerId",
        field(record, "customerLegacyId"),
        false,
    );

    let entity = CalendarEntry {
        header,
        title: field(record, "title").to_string(),
        date: draft.date(field(record, "date"), "date"),
        start_time: draft.time(field(record, "startTime"), "startTime"),
        end_time: draft.time(field(record, "endTime"), "endTime"),
        course_id,
        customer_id,
    };
    draft.finish(CanonicalEntity::CalendarEntry(entity))
}

#[must_use]
pub fn map_finance_entry(record: &LegacyRecord, ctx: &mut MappingContext<'_>) -> MappedRecord {
    let mut draft = Draft::new(Module::Finance);
    let header = header(Module::Finance, record, ctx, &mut draft);
    let customer_id = draft.reference(
        ctx,
        Module::Customers,
        "customerId",
        field(record, "customerLegacyId"),
        true,
    );

    let entity = FinanceEntry {
        header,
        customer_id,
        date: draft.date(field(record, "date"), "date"),
        amount_cents: draft.cents(field(record, "amount"), "amount"),
        kind: draft.status(field(record, "kind"), FINANCE_KIND, "kind"),
        description: field(record, "description").to_string(),
    };
    draft.finish(CanonicalEntity::FinanceEntry(entity))
}

#[must_use]
pub fn map_merchandise_sale(record: &LegacyRecord, ctx: &mut MappingContext<'_>) -> MappedRecord {
    let mut draft = Draft::new(Module::Merchandise);
    let header = header(Module::Merchandise, record, ctx, &mut draft);
    let customer_id = draft.reference(
        ctx,
        Module::Customers,
        "customerId",
        field(record, "customerLegacyId"),
        false,
    );

    let entity = MerchandiseSale {
        header,
        customer_id,
        date: draft.date(field(record, "date"), "date"),
        article: field(record, "article").to_string(),
        quantity: draft.count(field(record, "quantity"), "quantity"),
        price_cents: draft.cents(field(record, "price"), "price"),
    };
    draft.finish(CanonicalEntity::MerchandiseSale(entity))
}

#[must_use]
pub fn map_record(
    module: Module,
    record: &LegacyRecord,
    ctx: &mut MappingContext<'_>,
) -> MappedRecord {
    match module {
        Module::Customers => map_customer(record, ctx),
        Module::Dogs => map_dog(record, ctx),
        Module::Trainers => map_trainer(record, ctx),
        Module::Courses => map_course(record, ctx),
        Module::Calendar => map_calendar_entry(record, ctx),
        Module::Finance => map_finance_entry(record, ctx),
        Module::Merchandise => map_merchandise_sale(record, ctx),
    }
}

/// Map all rows of one module.
///
/// Rows are stable-sorted by legacy id first, so duplicate suffixes depend
/// only on the relative export order of rows sharing a key. Repeated legacy
/// ids become `{id}__dup2`, `{id}__dup3`, ... in that order. The module's
/// legacy ids are then published on the context for later modules.
pub fn map_module(
    module: Module,
    mut rows: Vec<LegacyRecord>,
    ctx: &mut MappingContext<'_>,
) -> ModuleBatch {
    rows.sort_by(|lhs, rhs| natural_cmp(field(lhs, LEGACY_ID), field(rhs, LEGACY_ID)));

    let mut seen: BTreeMap<String, usize> = BTreeMap::new();
    let mut known = BTreeSet::new();
    let mut entities = Vec::with_capacity(rows.len());
    let mut issues = Vec::new();

    for mut row in rows {
        let legacy_id = field(&row, LEGACY_ID).to_string();
        let mut duplicate_of = None;
        if !legacy_id.is_empty() {
            let count = seen.entry(legacy_id.clone()).or_insert(0);
            *count += 1;
            if *count > 1 {
                let suffixed = format!("{legacy_id}__dup{count}");
                row.insert(LEGACY_ID.to_string(), suffixed.clone());
                duplicate_of = Some(suffixed);
            }
            known.insert(field(&row, LEGACY_ID).to_string());
        }

        let mapped = map_record(module, &row, ctx);
        if let Some(suffixed) = duplicate_of {
            issues.push(Issue::warning(
                module,
                &mapped.entity.header().id,
                CheckType::Mapping,
                "LEGACY_ID_DUPLICATE",
                format!("legacy id {legacy_id} repeated; stored as {suffixed}"),
            ));
        }
        issues.extend(mapped.issues);
        entities.push(mapped.entity);
    }

    debug!(module = %module, records = entities.len(), issues = issues.len(), "mapped module");
    ctx.legacy_ids.insert(module, known);
    ModuleBatch { module, entities, issues }
}
