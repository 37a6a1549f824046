//! Character sheets - read-only input to combat
//!
//! Sheets are authored outside this server and loaded from the store when a
//! match is seeded. Derived stats are computed once by the ruleset adapter.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::dice::DamageFormula;
use super::RulesetId;

/// Damage classification shared by both rule systems. The contested-defense
/// ruleset keys wounding multipliers off it; the DC-based ruleset carries it
/// for presentation only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DamageKind {
    Crushing,
    Cutting,
    Impaling,
    Piercing,
    Bludgeoning,
    Slashing,
    Fire,
}

/// A character as stored: identity plus a ruleset-specific block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterSheet {
    pub id: Uuid,
    pub name: String,
    pub ruleset: RulesetId,
    #[serde(flatten)]
    pub block: SheetBlock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetBlock {
    Gurps(GurpsSheet),
    Pf2(Pf2Sheet),
}

impl CharacterSheet {
    pub fn gurps(&self) -> Option<&GurpsSheet> {
        match &self.block {
            SheetBlock::Gurps(s) => Some(s),
            SheetBlock::Pf2(_) => None,
        }
    }

    pub fn pf2(&self) -> Option<&Pf2Sheet> {
        match &self.block {
            SheetBlock::Pf2(s) => Some(s),
            SheetBlock::Gurps(_) => None,
        }
    }
}

// ============================================================================
// Contested-defense (GURPS-style) sheet
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GurpsSheet {
    pub st: i32,
    pub dx: i32,
    pub iq: i32,
    pub ht: i32,
    pub weapons: Vec<GurpsWeapon>,
    pub shield: Option<GurpsShield>,
    /// Flat damage resistance from worn armor.
    pub armor_dr: i32,
    /// DX-based grappling skill, if trained (falls back to DX).
    pub grapple_skill: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GurpsWeapon {
    pub name: String,
    /// Effective weapon skill level.
    pub skill: i32,
    pub damage: DamageFormula,
    pub kind: DamageKind,
    /// Melee reach in hexes; ranged weapons attack out to `max_range`.
    pub reach: u32,
    pub ranged: bool,
    pub max_range: u32,
    /// Modifier to the Parry defense while wielding this weapon.
    pub parry_mod: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GurpsShield {
    pub name: String,
    /// Shield skill level, halved (+3) for Block.
    pub skill: i32,
    /// Defense Bonus added to all active defenses while readied.
    pub db: i32,
}

// ============================================================================
// DC-based (PF2-style) sheet
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pf2Sheet {
    pub ac: i32,
    pub max_hp: i32,
    pub perception: i32,
    pub fortitude: i32,
    pub reflex: i32,
    pub will: i32,
    pub class_dc: i32,
    /// Land speed in grid squares per Stride.
    pub speed: u32,
    pub attacks: Vec<Pf2Attack>,
    pub skills: Pf2Skills,
    pub spells: Vec<Pf2Spell>,
    pub spell_slots: u8,
    pub focus_points: u8,
    pub shield: Option<Pf2Shield>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pf2Attack {
    pub name: String,
    pub bonus: i32,
    pub damage: DamageFormula,
    pub kind: DamageKind,
    /// Agile weapons use the reduced multiple attack penalty.
    pub agile: bool,
    /// Reach in squares (1 = adjacent).
    pub reach: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pf2Skills {
    pub athletics: i32,
    pub acrobatics: i32,
    pub deception: i32,
    pub intimidation: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pf2Spell {
    pub name: String,
    /// Spell attack roll vs AC when true; otherwise target saves vs class DC.
    pub attack_roll: bool,
    pub damage: DamageFormula,
    pub kind: DamageKind,
    pub range: u32,
    /// Costs a focus point instead of a spell slot.
    pub focus: bool,
    /// Actions to cast.
    pub actions: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pf2Shield {
    pub name: String,
    /// AC bonus while raised.
    pub ac_bonus: i32,
}

// ============================================================================
// Stock sheets for bot-filled matches and tests
// ============================================================================

/// A plain sword-and-shield fighter for the contested-defense ruleset.
pub fn stock_gurps_fighter(name: &str) -> CharacterSheet {
    CharacterSheet {
        id: Uuid::new_v4(),
        name: name.to_string(),
        ruleset: RulesetId::Gurps,
        block: SheetBlock::Gurps(GurpsSheet {
            st: 12,
            dx: 12,
            iq: 10,
            ht: 11,
            weapons: vec![
                GurpsWeapon {
                    name: "Broadsword".to_string(),
                    skill: 14,
                    damage: DamageFormula::new(1, 6, 2),
                    kind: DamageKind::Cutting,
                    reach: 1,
                    ranged: false,
                    max_range: 0,
                    parry_mod: 0,
                },
                GurpsWeapon {
                    name: "Large Knife".to_string(),
                    skill: 12,
                    damage: DamageFormula::new(1, 6, 0),
                    kind: DamageKind::Impaling,
                    reach: 1,
                    ranged: false,
                    max_range: 0,
                    parry_mod: -1,
                },
            ],
            shield: Some(GurpsShield {
                name: "Medium Shield".to_string(),
                skill: 13,
                db: 2,
            }),
            armor_dr: 3,
            grapple_skill: Some(13),
        }),
    }
}

/// A plain martial character for the DC-based ruleset.
pub fn stock_pf2_fighter(name: &str) -> CharacterSheet {
    CharacterSheet {
        id: Uuid::new_v4(),
        name: name.to_string(),
        ruleset: RulesetId::Pf2,
        block: SheetBlock::Pf2(Pf2Sheet {
            ac: 18,
            max_hp: 28,
            perception: 7,
            fortitude: 9,
            reflex: 7,
            will: 5,
            class_dc: 17,
            speed: 5,
            attacks: vec![
                Pf2Attack {
                    name: "Longsword".to_string(),
                    bonus: 9,
                    damage: DamageFormula::new(1, 8, 3),
                    kind: DamageKind::Slashing,
                    agile: false,
                    reach: 1,
                },
                Pf2Attack {
                    name: "Shortsword".to_string(),
                    bonus: 9,
                    damage: DamageFormula::new(1, 6, 3),
                    kind: DamageKind::Piercing,
                    agile: true,
                    reach: 1,
                },
            ],
            skills: Pf2Skills {
                athletics: 9,
                acrobatics: 5,
                deception: 2,
                intimidation: 5,
            },
            spells: vec![],
            spell_slots: 0,
            focus_points: 0,
            shield: Some(Pf2Shield {
                name: "Steel Shield".to_string(),
                ac_bonus: 2,
            }),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sheet_block_round_trips_through_json() {
        let sheet = stock_gurps_fighter("Anser");
        let json = serde_json::to_string(&sheet).expect("serialize");
        let back: CharacterSheet = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.name, "Anser");
        assert!(back.gurps().is_some());
        assert!(back.pf2().is_none());
    }
}
