//! Declarative per-module validation rules.

use crate::Module;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ForeignKey {
    pub field: &'static str,
    pub target: Module,
    pub required: bool,
    /// Multi-valued reference stored as a sorted array of ids.
    pub relation_set: bool,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Invariant {
    TimeRange { start: &'static str, end: &'static str },
    Capacity { capacity: &'static str, booked: &'static str },
    NonNegativeAmount { field: &'static str },
    NonNegativePrice { field: &'static str },
    AtLeastOneRef { first: &'static str, second: &'static str },
}

impl Invariant {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::TimeRange { .. } => "timeRange",
            Self::Capacity { .. } => "capacity",
            Self::NonNegativeAmount { .. } => "nonNegativeAmount",
            Self::NonNegativePrice { .. } => "nonNegativePrice",
            Self::AtLeastOneRef { .. } => "atLeastOneRef",
        }
    }

    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::TimeRange { .. } => "INVARIANT_TIME_RANGE",
            Self::Capacity { .. } => "INVARIANT_CAPACITY",
            Self::NonNegativeAmount { .. } => "INVARIANT_NON_NEGATIVE_AMOUNT",
            Self::NonNegativePrice { .. } => "INVARIANT_NON_NEGATIVE_PRICE",
            Self::AtLeastOneRef { .. } => "INVARIANT_AT_LEAST_ONE_REF",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ModuleRules {
    pub module: Module,
    pub required: &'static [&'static str],
    pub foreign_keys: &'static [ForeignKey],
    pub invariants: &'static [Invariant],
    /// Fields that identify a person. Allowed only inside `data.jsonl`.
    pub pii: &'static [&'static str],
}

static CUSTOMERS: ModuleRules = ModuleRules {
    module: Module::Customers,
    required: &["id", "code", "createdAt", "updatedAt", "legacyId", "lastName"],
    foreign_keys: &[],
    invariants: &[],
    pii: &["firstName", "lastName", "email", "phone", "street"],
};

static DOGS: ModuleRules = ModuleRules {
    module: Module::Dogs,
    required: &["id", "code", "createdAt", "updatedAt", "legacyId", "name", "ownerId"],
    foreign_keys: &[ForeignKey {
        field: "ownerId",
        target: Module::Customers,
        required: true,
        relation_set: false,
    }],
    invariants: &[],
    pii: &[],
};

static TRAINERS: ModuleRules = ModuleRules {
    module: Module::Trainers,
    required: &["id", "code", "createdAt", "updatedAt", "legacyId", "lastName"],
    foreign_keys: &[],
    invariants: &[],
    pii: &["firstName", "lastName", "email", "phone"],
};

static COURSES: ModuleRules = ModuleRules {
    module: Module::Courses,
    required: &["id", "code", "createdAt", "updatedAt", "legacyId", "title"],
    foreign_keys: &[ForeignKey {
        field: "trainerIds",
        target: Module::Trainers,
        required: false,
        relation_set: true,
    }],
    invariants: &[
        Invariant::TimeRange { start: "startTime", end: "endTime" },
        Invariant::Capacity { capacity: "capacity", booked: "booked" },
        Invariant::NonNegativePrice { field: "priceCents" },
    ],
    pii: &[],
};

static CALENDAR: ModuleRules = ModuleRules {
    module: Module::Calendar,
    required: &["id", "code", "createdAt", "updatedAt", "legacyId", "date"],
    foreign_keys: &[
        ForeignKey {
            field: "courseId",
            target: Module::Courses,
            required: false,
            relation_set: false,
        },
        ForeignKey {
            field: "customerId",
            target: Module::Customers,
            required: false,
            relation_set: false,
        },
    ],
    invariants: &[
        Invariant::TimeRange { start: "startTime", end: "endTime" },
        Invariant::AtLeastOneRef { first: "courseId", second: "customerId" },
    ],
    pii: &[],
};

static FINANCE: ModuleRules = ModuleRules {
    module: Module::Finance,
    required: &[
        "id",
        "code",
        "createdAt",
        "updatedAt",
        "legacyId",
        "customerId",
        "date",
        "amountCents",
    ],
    foreign_keys: &[ForeignKey {
        field: "customerId",
        target: Module::Customers,
        required: true,
        relation_set: false,
    }],
    invariants: &[Invariant::NonNegativeAmount { field: "amountCents" }],
    pii: &[],
};

static MERCHANDISE: ModuleRules = ModuleRules {
    module: Module::Merchandise,
    required: &["id", "code", "createdAt", "updatedAt", "legacyId", "article"],
    foreign_keys: &[ForeignKey {
        field: "customerId",
        target: Module::Customers,
        required: false,
        relation_set: false,
    }],
    invariants: &[Invariant::NonNegativePrice { field: "priceCents" }],
    pii: &[],
};

#[must_use]
pub fn rules_for(module: Module) -> &'static ModuleRules {
    match module {
        Module::Customers => &CUSTOMERS,
        Module::Dogs => &DOGS,
        Module::Trainers => &TRAINERS,
        Module::Courses => &COURSES,
        Module::Calendar => &CALENDAR,
        Module::Finance => &FINANCE,
        Module::Merchandise => &MERCHANDISE,
    }
}

/// Union of PII field names across all modules.
#[must_use]
pub fn all_pii_fields() -> Vec<&'static str> {
    let mut fields: Vec<&'static str> =
        Module::ALL.iter().flat_map(|module| rules_for(*module).pii.iter().copied()).collect();
    fields.sort_unstable();
    fields.dedup();
    fields
}

/// `ownerId` -> `OWNER_ID`, used to build field-specific issue codes.
#[must_use]
pub fn field_code(field: &str) -> String {
    let mut code = String::with_capacity(field.len() + 4);
    for (index, ch) in field.chars().enumerate() {
        if ch.is_ascii_uppercase() && index > 0 {
            code.push('_');
        }
        code.push(ch.to_ascii_uppercase());
    }
    code
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMMON_REQUIRED: [&str; 5] = ["id", "code", "createdAt", "updatedAt", "legacyId"];

    #[test]
    fn every_module_requires_the_common_header() {
        for module in Module::ALL {
            let rules = rules_for(module);
            assert_eq!(rules.module, module);
            for field in COMMON_REQUIRED {
                assert!(rules.required.contains(&field), "{module} must require {field}");
            }
        }
    }

    #[test]
    fn foreign_keys_only_point_to_earlier_modules() {
        for (position, module) in Module::ALL.iter().enumerate() {
            for fk in rules_for(*module).foreign_keys {
                let target_position = Module::ALL.iter().position(|m| *m == fk.target);
                assert!(target_position.is_some_and(|target| target < position));
            }
        }
    }

    #[test]
    fn field_codes_are_upper_snake_case() {
        assert_eq!(field_code("ownerId"), "OWNER_ID");
        assert_eq!(field_code("trainerIds"), "TRAINER_IDS");
        assert_eq!(field_code("id"), "ID");
    }

    #[test]
    fn pii_fields_are_deduplicated() {
        let fields = all_pii_fields();
        assert_eq!(fields, vec!["email", "firstName", "lastName", "phone", "street"]);
    }
}
