//! Per-channel IIR filtering: a notch feeding parallel low-pass and high-pass cascades.

pub mod cascade;
pub mod design;

pub use cascade::{
    Cascade, ChannelFilters, FilterPlan, FilteredSample, Section, CHANNEL_SECTIONS, MAX_SECTIONS,
    SECTION_COEFFICIENTS, SECTION_HISTORY,
};
pub use design::{Band, PrototypeSection, SectionShape};
