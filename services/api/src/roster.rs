use consent_tracker::error::AppError;
use consent_tracker::workflows::consent::{
    ClassId, ContactHandle, InMemoryConsentStore, ParentId, RepositoryError, TeacherId,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Counts of what a roster import created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub(crate) struct RosterSummary {
    pub(crate) teachers: usize,
    pub(crate) classes: usize,
    pub(crate) students: usize,
    pub(crate) registered_parents: usize,
}

#[derive(Debug, Deserialize)]
struct RosterRow {
    class: String,
    teacher: String,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    teacher_contact: Option<String>,
    student: String,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    parent: Option<String>,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    parent_contact: Option<String>,
}

pub(crate) fn import_roster_file(
    path: impl AsRef<Path>,
    store: &InMemoryConsentStore,
) -> Result<RosterSummary, AppError> {
    let file = File::open(path)?;
    import_roster(file, store)
}

/// Load `class,teacher,teacher_contact,student,parent,parent_contact` rows into the store.
///
/// Rows sharing a `parent_contact` are siblings and get a single parent account.
pub(crate) fn import_roster<R: Read>(
    reader: R,
    store: &InMemoryConsentStore,
) -> Result<RosterSummary, AppError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut teachers: HashMap<String, TeacherId> = HashMap::new();
    let mut classes: HashMap<String, (ClassId, String)> = HashMap::new();
    let mut parents: HashMap<String, ParentId> = HashMap::new();
    let mut summary = RosterSummary::default();

    for (index, record) in csv_reader.deserialize::<RosterRow>().enumerate() {
        let row = record?;
        // Header is line 1.
        let line = index + 2;
        let at_line = |err: RepositoryError| AppError::Roster(format!("line {line}: {err}"));

        let teacher_id = match teachers.get(&row.teacher) {
            Some(id) => *id,
            None => {
                let contact = row.teacher_contact.clone().map(ContactHandle);
                let teacher = store.add_teacher(&row.teacher, contact).map_err(at_line)?;
                summary.teachers += 1;
                teachers.insert(row.teacher.clone(), teacher.id);
                teacher.id
            }
        };

        let class_id = match classes.get(&row.class) {
            Some((id, owner)) if owner == &row.teacher => *id,
            Some((_, owner)) => {
                return Err(AppError::Roster(format!(
                    "line {line}: class '{}' already belongs to {owner}",
                    row.class
                )))
            }
            None => {
                let class = store.add_class(&row.class, teacher_id).map_err(at_line)?;
                summary.classes += 1;
                classes.insert(row.class.clone(), (class.id, row.teacher.clone()));
                class.id
            }
        };

        let sibling_parent = row
            .parent_contact
            .as_ref()
            .and_then(|contact| parents.get(contact).copied());
        match sibling_parent {
            Some(parent_id) => {
                let student = store.add_student(class_id, &row.student).map_err(at_line)?;
                store.link_parent(parent_id, student.id).map_err(at_line)?;
            }
            None => {
                let (_, parent) = store
                    .enroll_student(class_id, &row.student, row.parent.as_deref())
                    .map_err(at_line)?;
                if let Some(contact) = row.parent_contact.clone() {
                    store
                        .register_parent(parent.id, ContactHandle(contact.clone()))
                        .map_err(at_line)?;
                    parents.insert(contact, parent.id);
                    summary.registered_parents += 1;
                }
            }
        }
        summary.students += 1;
    }

    Ok(summary)
}

fn empty_string_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt = Option::<String>::deserialize(deserializer)?;
    Ok(opt.filter(|value| !value.trim().is_empty()))
}
