//! Fixed catalog of intelligence modules.
//!
//! The module set is closed: every identifier is a `ModuleId` variant, and
//! parsing a path segment into a `ModuleId` is the registry lookup. Anything
//! that fails to parse is rejected with `IntelError::UnknownModule` before
//! any state is touched.

use crate::error::{IntelError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Execution group a module belongs to during a run-all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// Runs alone, before everything else. Seeds shared context.
    SoloFirst,
    /// Runs concurrently with its siblings.
    ParallelMiddle,
    /// Runs alone, after everything else has settled.
    SoloLast,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::SoloFirst => "solo-first",
            Phase::ParallelMiddle => "parallel-middle",
            Phase::SoloLast => "solo-last",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ModuleId
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleId {
    TenderHistory,
    ProfileAnalysis,
    Participants,
    RegulatoryDecisions,
    DebarmentCheck,
    CompanyRegistry,
    News,
    AiSynthesis,
}

impl ModuleId {
    /// Every module, in catalog order.
    pub const ALL: [ModuleId; 8] = [
        ModuleId::TenderHistory,
        ModuleId::ProfileAnalysis,
        ModuleId::Participants,
        ModuleId::RegulatoryDecisions,
        ModuleId::DebarmentCheck,
        ModuleId::CompanyRegistry,
        ModuleId::News,
        ModuleId::AiSynthesis,
    ];

    /// Stable key used for persistence and dispatch. Never rename.
    pub fn as_str(self) -> &'static str {
        match self {
            ModuleId::TenderHistory => "tender_history",
            ModuleId::ProfileAnalysis => "profile_analysis",
            ModuleId::Participants => "participants",
            ModuleId::RegulatoryDecisions => "regulatory_decisions",
            ModuleId::DebarmentCheck => "debarment_check",
            ModuleId::CompanyRegistry => "company_registry",
            ModuleId::News => "news",
            ModuleId::AiSynthesis => "ai_synthesis",
        }
    }

    pub fn descriptor(self) -> ModuleDescriptor {
        let (phase, title) = match self {
            ModuleId::TenderHistory => (Phase::SoloFirst, "Tender history"),
            ModuleId::ProfileAnalysis => (
                Phase::ParallelMiddle,
                "Profile analysis (yearly trend, rivals, buyers, sectors)",
            ),
            ModuleId::Participants => (Phase::ParallelMiddle, "Tender participants"),
            ModuleId::RegulatoryDecisions => (
                Phase::ParallelMiddle,
                "Procurement authority decisions (complaints & objections)",
            ),
            ModuleId::DebarmentCheck => (Phase::ParallelMiddle, "Debarment registry lookup"),
            ModuleId::CompanyRegistry => (
                Phase::ParallelMiddle,
                "Company identity (trade registry gazette)",
            ),
            ModuleId::News => (Phase::ParallelMiddle, "News and media scan"),
            ModuleId::AiSynthesis => (Phase::SoloLast, "AI intelligence report (threat analysis)"),
        };
        ModuleDescriptor {
            id: self,
            phase,
            title,
        }
    }

    pub fn phase(self) -> Phase {
        self.descriptor().phase
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModuleId {
    type Err = IntelError;

    fn from_str(s: &str) -> Result<Self> {
        ModuleId::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| IntelError::UnknownModule(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// ModuleDescriptor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModuleDescriptor {
    pub id: ModuleId,
    pub phase: Phase,
    pub title: &'static str,
}

/// Look up a module by its string key.
pub fn describe(module: &str) -> Result<ModuleDescriptor> {
    module.parse::<ModuleId>().map(ModuleId::descriptor)
}

/// All modules assigned to `phase`, in catalog order.
pub fn list_by_phase(phase: Phase) -> Vec<ModuleDescriptor> {
    ModuleId::ALL
        .into_iter()
        .map(ModuleId::descriptor)
        .filter(|d| d.phase == phase)
        .collect()
}

/// The single solo-first module.
pub fn solo_first() -> ModuleId {
    ModuleId::TenderHistory
}

/// The single solo-last module.
pub fn solo_last() -> ModuleId {
    ModuleId::AiSynthesis
}
