use serde::Serialize;
use std::fmt;

/// Entity kinds whose workflow state an import can change and a restore can
/// put back. The declaration order is the restore order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum EntityKind {
    Account,
    EnrollmentTerm,
    AbstractCourse,
    Course,
    CourseSection,
    GroupCategory,
    Group,
    Pseudonym,
    CommunicationChannel,
    Enrollment,
    GroupMembership,
    UserObserver,
    AccountUser,
    AssignmentOverrideStudent,
}

pub const RESTORE_ORDER: [EntityKind; 14] = [
    EntityKind::Account,
    EntityKind::EnrollmentTerm,
    EntityKind::AbstractCourse,
    EntityKind::Course,
    EntityKind::CourseSection,
    EntityKind::GroupCategory,
    EntityKind::Group,
    EntityKind::Pseudonym,
    EntityKind::CommunicationChannel,
    EntityKind::Enrollment,
    EntityKind::GroupMembership,
    EntityKind::UserObserver,
    EntityKind::AccountUser,
    EntityKind::AssignmentOverrideStudent,
];

impl EntityKind {
    pub fn context_type(self) -> &'static str {
        match self {
            Self::Account => "Account",
            Self::EnrollmentTerm => "EnrollmentTerm",
            Self::AbstractCourse => "AbstractCourse",
            Self::Course => "Course",
            Self::CourseSection => "CourseSection",
            Self::GroupCategory => "GroupCategory",
            Self::Group => "Group",
            Self::Pseudonym => "Pseudonym",
            Self::CommunicationChannel => "CommunicationChannel",
            Self::Enrollment => "Enrollment",
            Self::GroupMembership => "GroupMembership",
            Self::UserObserver => "UserObserver",
            Self::AccountUser => "AccountUser",
            Self::AssignmentOverrideStudent => "AssignmentOverrideStudent",
        }
    }

    pub fn from_context_type(s: &str) -> Option<Self> {
        RESTORE_ORDER.iter().copied().find(|k| k.context_type() == s)
    }

    pub fn table(self) -> &'static str {
        match self {
            Self::Account => "accounts",
            Self::EnrollmentTerm => "enrollment_terms",
            Self::AbstractCourse => "abstract_courses",
            Self::Course => "courses",
            Self::CourseSection => "course_sections",
            Self::GroupCategory => "group_categories",
            Self::Group => "groups",
            Self::Pseudonym => "pseudonyms",
            Self::CommunicationChannel => "communication_channels",
            Self::Enrollment => "enrollments",
            Self::GroupMembership => "group_memberships",
            Self::UserObserver => "user_observers",
            Self::AccountUser => "account_users",
            Self::AssignmentOverrideStudent => "assignment_override_students",
        }
    }

    /// Accepts the context type ("CourseSection") or the table name
    /// ("course_sections").
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        RESTORE_ORDER
            .iter()
            .copied()
            .find(|k| k.context_type().eq_ignore_ascii_case(s) || k.table() == s)
    }

    /// Group categories carry a deletion timestamp instead of a state string.
    pub fn has_workflow_state(self) -> bool {
        !matches!(self, Self::GroupCategory)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.context_type())
    }
}

/// Reference to one row of one of the tracked entity tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: i64,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: i64) -> Self {
        Self { kind, id }
    }
}
