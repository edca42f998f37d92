// entities/mod.rs - CRUD over notes, relations, reflections, keywords

pub mod keywords;
pub mod notes;
pub mod reflections;
pub mod relations;

pub use keywords::KeywordRepository;
pub use notes::{Note, NoteFilters, NotesRepository};
pub use reflections::{Reflection, ReflectionsRepository};
pub use relations::{Relation, RelationsRepository};
