//! Static entity plane classification.
//!
//! Every domain module lives either in the shared control-plane database or in
//! each tenant's own database. The mapping is fixed at build time.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Which database family an entity lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plane {
    ControlPlane,
    TenantPlane,
}

impl fmt::Display for Plane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Plane::ControlPlane => f.write_str("control-plane"),
            Plane::TenantPlane => f.write_str("tenant-plane"),
        }
    }
}

/// Owning module of a domain object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Module {
    // control plane
    Core,
    Auth,
    Sessions,
    School,
    Subscriptions,
    // tenant plane
    Academics,
    Classes,
    Student,
    Teacher,
    Syllabus,
    Exams,
    Attendance,
    Reports,
}

impl Module {
    pub const ALL: [Module; 13] = [
        Module::Core,
        Module::Auth,
        Module::Sessions,
        Module::School,
        Module::Subscriptions,
        Module::Academics,
        Module::Classes,
        Module::Student,
        Module::Teacher,
        Module::Syllabus,
        Module::Exams,
        Module::Attendance,
        Module::Reports,
    ];

    pub const fn plane(self) -> Plane {
        match self {
            Module::Core
            | Module::Auth
            | Module::Sessions
            | Module::School
            | Module::Subscriptions => Plane::ControlPlane,
            Module::Academics
            | Module::Classes
            | Module::Student
            | Module::Teacher
            | Module::Syllabus
            | Module::Exams
            | Module::Attendance
            | Module::Reports => Plane::TenantPlane,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Module::Core => "core",
            Module::Auth => "auth",
            Module::Sessions => "sessions",
            Module::School => "school",
            Module::Subscriptions => "subscriptions",
            Module::Academics => "academics",
            Module::Classes => "classes",
            Module::Student => "student",
            Module::Teacher => "teacher",
            Module::Syllabus => "syllabus",
            Module::Exams => "exams",
            Module::Attendance => "attendance",
            Module::Reports => "reports",
        }
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Module {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Module::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| CoreError::invalid("module", format!("unknown module '{}'", s)))
    }
}

/// Implemented by every persisted domain type so routing can be decided from
/// the type alone.
pub trait PlaneEntity {
    const MODULE: Module;

    fn plane() -> Plane {
        Self::MODULE.plane()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_and_billing_are_control_plane() {
        for module in [
            Module::Core,
            Module::Auth,
            Module::Sessions,
            Module::School,
            Module::Subscriptions,
        ] {
            assert_eq!(module.plane(), Plane::ControlPlane, "{}", module);
        }
    }

    #[test]
    fn school_owned_entities_are_tenant_plane() {
        let tenant_modules: Vec<_> = Module::ALL
            .iter()
            .filter(|m| m.plane() == Plane::TenantPlane)
            .collect();
        assert_eq!(tenant_modules.len(), 8);
        assert!(tenant_modules.contains(&&Module::Student));
        assert!(tenant_modules.contains(&&Module::Attendance));
    }

    #[test]
    fn module_names_round_trip() {
        for module in Module::ALL {
            assert_eq!(module.as_str().parse::<Module>().unwrap(), module);
        }
        assert!("billing".parse::<Module>().is_err());
    }

    struct Classroom;
    impl PlaneEntity for Classroom {
        const MODULE: Module = Module::Classes;
    }

    #[test]
    fn entity_plane_follows_module() {
        assert_eq!(Classroom::plane(), Plane::TenantPlane);
    }
}
