//! The schema catalog: the in-process description of the tables, columns,
//! and semantic hints the translator grounds on and the validator enforces.
//!
//! Built once at startup, immutable thereafter, safe for lock-free read.

use std::collections::BTreeMap;

use serde::Serialize;

/// Geography level of a table or entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeoLevel {
    State,
    County,
    Tract,
    BlockGroup,
}

impl GeoLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::State => "state",
            Self::County => "county",
            Self::Tract => "tract",
            Self::BlockGroup => "block_group",
        }
    }
}

/// Column data type as stored in the analytical engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    BigInt,
    Double,
}

/// One column with its semantic hint for the translator prompt.
#[derive(Debug, Clone, Serialize)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub column_type: ColumnType,
    pub description: &'static str,
}

/// One allowlisted table.
#[derive(Debug, Clone, Serialize)]
pub struct TableSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub geography: GeoLevel,
    pub primary_key: &'static str,
    pub columns: Vec<ColumnSpec>,
}

impl TableSpec {
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns.iter().map(|c| c.name)
    }
}

/// A comparison region resolved from a human name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionSelector {
    /// A whole state, by 2-digit FIPS code.
    State(&'static str),
    /// A metro area, as the set of 5-digit county FIPS codes it spans.
    Counties(&'static [&'static str]),
}

/// Process-wide description of the permitted schema.
#[derive(Debug)]
pub struct SchemaCatalog {
    tables: Vec<TableSpec>,
    states: BTreeMap<&'static str, &'static str>,
    metros: BTreeMap<&'static str, &'static [&'static str]>,
}

impl SchemaCatalog {
    /// Build the ACS demographics catalog.
    pub fn acs() -> Self {
        Self {
            tables: acs_tables(),
            states: state_fips_map(),
            metros: metro_map(),
        }
    }

    pub fn tables(&self) -> &[TableSpec] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&TableSpec> {
        self.tables
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn is_table_allowed(&self, name: &str) -> bool {
        self.table(name).is_some()
    }

    /// True when `column` exists in at least one of `tables`.
    pub fn column_in_tables(&self, column: &str, tables: &[String]) -> bool {
        tables
            .iter()
            .filter_map(|t| self.table(t))
            .any(|t| t.column(column).is_some())
    }

    /// True when `column` exists anywhere in the catalog.
    pub fn is_column_known(&self, column: &str) -> bool {
        self.tables.iter().any(|t| t.column(column).is_some())
    }

    /// Map a state name (or postal-style abbreviation passthrough) to its
    /// 2-digit FIPS code.
    pub fn state_code(&self, name: &str) -> Option<&'static str> {
        let needle = name.trim().to_ascii_lowercase();
        self.states
            .iter()
            .find(|(state, _)| state.to_ascii_lowercase() == needle)
            .map(|(_, code)| *code)
    }

    pub fn state_name(&self, code: &str) -> Option<&'static str> {
        self.states
            .iter()
            .find(|(_, c)| **c == code)
            .map(|(name, _)| *name)
    }

    /// Resolve a human region name to a selector for comparisons.
    ///
    /// States match first; metro aliases ("Tampa Bay") second.
    pub fn resolve_region(&self, name: &str) -> Option<RegionSelector> {
        if let Some(code) = self.state_code(name) {
            return Some(RegionSelector::State(code));
        }
        let needle = name.trim().to_ascii_lowercase();
        self.metros
            .iter()
            .find(|(metro, _)| metro.to_ascii_lowercase() == needle)
            .map(|(_, counties)| RegionSelector::Counties(counties))
    }

    pub fn metro_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.metros.keys().copied()
    }

    /// Compact textual rendering embedded in the translator prompt.
    pub fn prompt_context(&self) -> String {
        let mut out = String::new();
        out.push_str("Available tables:\n");
        for table in &self.tables {
            out.push_str(&format!(
                "- {} ({} level): {}\n",
                table.name,
                table.geography.as_str(),
                table.description
            ));
            for column in &table.columns {
                out.push_str(&format!("    {}: {}\n", column.name, column.description));
            }
        }
        out.push_str("\nState FIPS codes (use codes, not names, in SQL):\n");
        for (name, code) in &self.states {
            out.push_str(&format!("  {code} = {name}\n"));
        }
        out.push_str("\nKnown metro areas (sets of county FIPS codes):\n");
        for (name, counties) in &self.metros {
            out.push_str(&format!("  {name}: {}\n", counties.join(", ")));
        }
        out
    }

    /// Wire shape for the `get_schema` tool.
    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::json!({
            "tables": self.tables,
            "states": self.states,
            "metros": self.metros,
        })
    }
}

fn acs_tables() -> Vec<TableSpec> {
    vec![
        TableSpec {
            name: "state_data",
            description: "ACS 5-year demographics aggregated per U.S. state",
            geography: GeoLevel::State,
            primary_key: "state",
            columns: vec![
                ColumnSpec {
                    name: "state",
                    column_type: ColumnType::Text,
                    description: "2-digit state FIPS code",
                },
                ColumnSpec {
                    name: "state_name",
                    column_type: ColumnType::Text,
                    description: "full state name",
                },
                ColumnSpec {
                    name: "population",
                    column_type: ColumnType::BigInt,
                    description: "total population",
                },
                ColumnSpec {
                    name: "median_age",
                    column_type: ColumnType::Double,
                    description: "median age in years",
                },
                ColumnSpec {
                    name: "median_household_income",
                    column_type: ColumnType::BigInt,
                    description: "median household income in USD",
                },
                ColumnSpec {
                    name: "population_65_plus",
                    column_type: ColumnType::BigInt,
                    description: "residents aged 65 and over",
                },
                ColumnSpec {
                    name: "medicare_eligible_count",
                    column_type: ColumnType::BigInt,
                    description: "estimated Medicare-eligible residents",
                },
                ColumnSpec {
                    name: "poverty_rate",
                    column_type: ColumnType::Double,
                    description: "share of residents below the poverty line (0-100)",
                },
                ColumnSpec {
                    name: "uninsured_rate",
                    column_type: ColumnType::Double,
                    description: "share of residents without health insurance (0-100)",
                },
            ],
        },
        TableSpec {
            name: "county_data",
            description: "ACS 5-year demographics per U.S. county",
            geography: GeoLevel::County,
            primary_key: "county_fips",
            columns: vec![
                ColumnSpec {
                    name: "county_fips",
                    column_type: ColumnType::Text,
                    description: "5-digit county FIPS code (state + county)",
                },
                ColumnSpec {
                    name: "state",
                    column_type: ColumnType::Text,
                    description: "2-digit state FIPS code",
                },
                ColumnSpec {
                    name: "county_name",
                    column_type: ColumnType::Text,
                    description: "county name",
                },
                ColumnSpec {
                    name: "state_name",
                    column_type: ColumnType::Text,
                    description: "full state name",
                },
                ColumnSpec {
                    name: "population",
                    column_type: ColumnType::BigInt,
                    description: "total population",
                },
                ColumnSpec {
                    name: "median_age",
                    column_type: ColumnType::Double,
                    description: "median age in years",
                },
                ColumnSpec {
                    name: "median_household_income",
                    column_type: ColumnType::BigInt,
                    description: "median household income in USD",
                },
                ColumnSpec {
                    name: "population_65_plus",
                    column_type: ColumnType::BigInt,
                    description: "residents aged 65 and over",
                },
                ColumnSpec {
                    name: "medicare_eligible_count",
                    column_type: ColumnType::BigInt,
                    description: "estimated Medicare-eligible residents",
                },
                ColumnSpec {
                    name: "poverty_rate",
                    column_type: ColumnType::Double,
                    description: "share of residents below the poverty line (0-100)",
                },
                ColumnSpec {
                    name: "uninsured_rate",
                    column_type: ColumnType::Double,
                    description: "share of residents without health insurance (0-100)",
                },
                ColumnSpec {
                    name: "hospital_count",
                    column_type: ColumnType::BigInt,
                    description: "number of hospitals located in the county",
                },
                ColumnSpec {
                    name: "physicians_per_10k",
                    column_type: ColumnType::Double,
                    description: "active physicians per 10,000 residents",
                },
            ],
        },
        TableSpec {
            name: "block_group_data",
            description: "ACS 5-year demographics per census block group",
            geography: GeoLevel::BlockGroup,
            primary_key: "geoid",
            columns: vec![
                ColumnSpec {
                    name: "geoid",
                    column_type: ColumnType::Text,
                    description: "12-character block group GEOID; first 5 chars are the county FIPS",
                },
                ColumnSpec {
                    name: "state",
                    column_type: ColumnType::Text,
                    description: "2-digit state FIPS code",
                },
                ColumnSpec {
                    name: "county_fips",
                    column_type: ColumnType::Text,
                    description: "5-digit county FIPS code",
                },
                ColumnSpec {
                    name: "tract",
                    column_type: ColumnType::Text,
                    description: "6-digit census tract code within the county",
                },
                ColumnSpec {
                    name: "population",
                    column_type: ColumnType::BigInt,
                    description: "total population",
                },
                ColumnSpec {
                    name: "median_household_income",
                    column_type: ColumnType::BigInt,
                    description: "median household income in USD",
                },
                ColumnSpec {
                    name: "population_65_plus",
                    column_type: ColumnType::BigInt,
                    description: "residents aged 65 and over",
                },
                ColumnSpec {
                    name: "medicare_eligible_count",
                    column_type: ColumnType::BigInt,
                    description: "estimated Medicare-eligible residents",
                },
                ColumnSpec {
                    name: "poverty_rate",
                    column_type: ColumnType::Double,
                    description: "share of residents below the poverty line (0-100)",
                },
            ],
        },
    ]
}

fn state_fips_map() -> BTreeMap<&'static str, &'static str> {
    BTreeMap::from([
        ("Alabama", "01"),
        ("Alaska", "02"),
        ("Arizona", "04"),
        ("Arkansas", "05"),
        ("California", "06"),
        ("Colorado", "08"),
        ("Connecticut", "09"),
        ("Delaware", "10"),
        ("District of Columbia", "11"),
        ("Florida", "12"),
        ("Georgia", "13"),
        ("Hawaii", "15"),
        ("Idaho", "16"),
        ("Illinois", "17"),
        ("Indiana", "18"),
        ("Iowa", "19"),
        ("Kansas", "20"),
        ("Kentucky", "21"),
        ("Louisiana", "22"),
        ("Maine", "23"),
        ("Maryland", "24"),
        ("Massachusetts", "25"),
        ("Michigan", "26"),
        ("Minnesota", "27"),
        ("Mississippi", "28"),
        ("Missouri", "29"),
        ("Montana", "30"),
        ("Nebraska", "31"),
        ("Nevada", "32"),
        ("New Hampshire", "33"),
        ("New Jersey", "34"),
        ("New Mexico", "35"),
        ("New York", "36"),
        ("North Carolina", "37"),
        ("North Dakota", "38"),
        ("Ohio", "39"),
        ("Oklahoma", "40"),
        ("Oregon", "41"),
        ("Pennsylvania", "42"),
        ("Rhode Island", "44"),
        ("South Carolina", "45"),
        ("South Dakota", "46"),
        ("Tennessee", "47"),
        ("Texas", "48"),
        ("Utah", "49"),
        ("Vermont", "50"),
        ("Virginia", "51"),
        ("Washington", "53"),
        ("West Virginia", "54"),
        ("Wisconsin", "55"),
        ("Wyoming", "56"),
        ("Puerto Rico", "72"),
    ])
}

fn metro_map() -> BTreeMap<&'static str, &'static [&'static str]> {
    const TAMPA_BAY: &[&str] = &["12057", "12101", "12103", "12053"];
    const PHOENIX: &[&str] = &["04013", "04021"];
    const MIAMI: &[&str] = &["12086", "12011", "12099"];
    const DFW: &[&str] = &["48113", "48439", "48085", "48121"];
    const HOUSTON: &[&str] = &["48201", "48157", "48339"];
    const ATLANTA: &[&str] = &["13121", "13089", "13135", "13067"];
    BTreeMap::from([
        ("Tampa Bay", TAMPA_BAY),
        ("Phoenix", PHOENIX),
        ("Miami", MIAMI),
        ("Dallas-Fort Worth", DFW),
        ("Houston", HOUSTON),
        ("Atlanta", ATLANTA),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn knows_the_spec_geographies() {
        let catalog = SchemaCatalog::acs();
        assert!(catalog.is_table_allowed("county_data"));
        assert!(catalog.is_table_allowed("BLOCK_GROUP_DATA"));
        assert!(!catalog.is_table_allowed("users"));
    }

    #[test]
    fn maps_state_names_to_fips() {
        let catalog = SchemaCatalog::acs();
        assert_eq!(catalog.state_code("Texas"), Some("48"));
        assert_eq!(catalog.state_code("florida"), Some("12"));
        assert_eq!(catalog.state_code("Atlantis"), None);
        assert_eq!(catalog.state_name("48"), Some("Texas"));
    }

    #[test]
    fn resolves_regions_for_comparison() {
        let catalog = SchemaCatalog::acs();
        assert_eq!(
            catalog.resolve_region("Arizona"),
            Some(RegionSelector::State("04"))
        );
        match catalog.resolve_region("Tampa Bay") {
            Some(RegionSelector::Counties(counties)) => {
                assert!(counties.contains(&"12057"));
            }
            other => panic!("unexpected resolution: {other:?}"),
        }
        assert_eq!(catalog.resolve_region("Gotham"), None);
    }

    #[test]
    fn column_lookup_is_scoped_to_tables() {
        let catalog = SchemaCatalog::acs();
        assert!(catalog.column_in_tables("geoid", &["block_group_data".to_string()]));
        assert!(!catalog.column_in_tables("geoid", &["county_data".to_string()]));
        assert!(catalog.is_column_known("medicare_eligible_count"));
    }

    #[test]
    fn prompt_context_grounds_tables_and_states() {
        let catalog = SchemaCatalog::acs();
        let context = catalog.prompt_context();
        assert!(context.contains("county_data"));
        assert!(context.contains("48 = Texas"));
        assert!(context.contains("Tampa Bay"));
    }
}
