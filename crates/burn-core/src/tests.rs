use super::*;

fn condition_variables() -> Variables {
    let mut variables = Variables::new();
    variables.set("Name", "abc").expect("must set Name");
    variables.set("Empty", "").expect("must set Empty");
    variables.set("Five", 5_i64).expect("must set Five");
    variables.set("FiveText", "5").expect("must set FiveText");
    variables.set("Six", 6_i64).expect("must set Six");
    variables.set("Packed", 0x0001_0005_i64).expect("must set Packed");
    variables.set("Negative", -1_i64).expect("must set Negative");
    variables
        .set("Ver", Variant::Version(pack_version(&[1, 2, 3, 4])))
        .expect("must set Ver");
    variables.set("VerText", "1.2.3.4").expect("must set VerText");
    variables.set("Quoted", "say \"hi\"").expect("must set Quoted");
    variables
}

fn eval(condition: &str) -> bool {
    evaluate_condition(&condition_variables(), condition).expect("condition should evaluate")
}

fn syntax_error(condition: &str) -> ConditionError {
    let err = evaluate_condition(&condition_variables(), condition)
        .expect_err("condition must fail to parse");
    assert!(err.is_syntax(), "expected syntax error for '{condition}': {err}");
    err
}

#[test]
fn bare_values_coerce_to_bool() {
    assert!(eval("Name"));
    assert!(!eval("Empty"));
    assert!(!eval("Undefined"));
    assert!(eval("\"x\""));
    assert!(!eval("\"\""));
    assert!(eval("5"));
    assert!(!eval("0"));
    assert!(eval("v1"));
    assert!(!eval("v0"));
}

#[test]
fn double_negation_is_identity() {
    for condition in ["Name", "Empty", "Five = 5", "Five = 6", "Undefined"] {
        assert_eq!(
            eval(&format!("NOT NOT {condition}")),
            eval(condition),
            "double negation changed '{condition}'"
        );
        assert_eq!(eval(&format!("NOT {condition}")), !eval(condition));
    }
}

#[test]
fn keywords_are_case_insensitive_and_respect_precedence() {
    assert!(eval("Name and Five"));
    assert!(eval("Empty Or Five"));
    assert!(!eval("not Name"));
    // AND binds tighter than OR.
    assert!(eval("Name OR Empty AND Empty"));
    assert!(!eval("(Name OR Empty) AND Empty"));
}

#[test]
fn version_literal_packs_four_sixteen_bit_fields() {
    assert!(eval("Ver = v1.2.3.4"));
    assert!(eval("Ver > v1.2.3"));
    assert!(eval("Ver < v1.2.3.5"));
    assert_eq!(
        parse_version_string("1.2.3.4"),
        Some((1_u64 << 48) | (2 << 32) | (3 << 16) | 4)
    );
}

#[test]
fn string_pattern_operators() {
    assert!(eval("\"abc\" >< \"b\""));
    assert!(eval("\"abc\" << \"ab\""));
    assert!(eval("\"abc\" >> \"bc\""));
    assert!(!eval("\"abc\" << \"bc\""));
    assert!(eval("Name >> \"c\""));
}

#[test]
fn tilde_comparators_ignore_string_case() {
    assert!(!eval("Name = \"ABC\""));
    assert!(eval("Name ~= \"ABC\""));
    assert!(!eval("Name ~<> \"aBc\""));
    assert!(eval("\"Hello World\" ~>< \"WORLD\""));
    assert!(eval("\"Hello World\" ~<< \"hello\""));
    assert!(eval("\"Hello World\" ~>> \"WORLD\""));
    assert!(!eval("\"Hello World\" ~>> \"hello\""));
    assert!(eval("Five ~= 5"));
    assert!(eval("Ver ~>= v1.2"));
}

#[test]
fn tilde_needs_an_adjacent_comparator() {
    let err = syntax_error("Name ~ = \"abc\"");
    assert!(matches!(err, ConditionError::Syntax { position: 5, .. }));
    syntax_error("Name ~abc");
    syntax_error("~= Name");
}

#[test]
fn numeric_pattern_operators_are_bit_tests() {
    assert!(eval("Six >< 4"));
    assert!(!eval("Six >< 1"));
    assert!(eval("Packed << 1"));
    assert!(eval("Packed >> 5"));
    assert!(!eval("Packed >> 1"));
}

#[test]
fn relational_operators_on_numbers() {
    assert!(eval("Five < 6"));
    assert!(eval("Five <= 5"));
    assert!(eval("Five >= 5"));
    assert!(!eval("Five > 5"));
    assert!(eval("Negative = -1"));
    assert!(eval("Negative < 0"));
}

#[test]
fn mismatched_kinds_coerce_or_fall_back_to_not_equal() {
    assert!(eval("FiveText = 5"));
    assert!(eval("Five = \"5\""));
    assert!(eval("VerText = v1.2.3.4"));
    assert!(eval("Ver = \"1.2.3.4\""));
    assert!(!eval("Name = 5"));
    assert!(eval("Name <> 5"));
    assert!(!eval("Name < 5"));
}

#[test]
fn undefined_variable_is_not_equal_to_anything() {
    assert!(eval("Undefined <> \"x\""));
    assert!(eval("Undefined <> 1"));
    assert!(!eval("Undefined = \"x\""));
    assert!(eval("Undefined = Missing"));
}

#[test]
fn doubled_quotes_embed_a_quote_in_literals() {
    assert!(eval("Quoted = \"say \"\"hi\"\"\""));
    assert!(eval("\"\"\"\" = \"\"\"\""));
}

#[test]
fn malformed_conditions_are_syntax_errors() {
    syntax_error("");
    syntax_error("   ");
    syntax_error("1abc");
    syntax_error("\"unterminated");
    syntax_error("(Name");
    syntax_error("Name AND");
    syntax_error("Name Five");
    syntax_error("v1.2.3.4.5");
    syntax_error("v70000");
    syntax_error("Name = ");
    syntax_error("Name # 1");

    let err = syntax_error("Name = = 1");
    assert!(matches!(err, ConditionError::Syntax { position: 7, .. }));
}

struct FailingLookup;

impl VariableLookup for FailingLookup {
    fn lookup(&self, name: &str) -> Result<Option<Variant>, VariableError> {
        Err(VariableError::NotFound(name.to_string()))
    }
}

#[test]
fn lookup_failures_are_not_syntax_errors() {
    let err = evaluate_condition(&FailingLookup, "Anything = 1")
        .expect_err("lookup failure must surface");
    assert!(!err.is_syntax());
    assert!(matches!(err, ConditionError::Variable { ref name, .. } if name == "Anything"));
}

#[test]
fn format_substitutes_known_variables() {
    let mut variables = Variables::new();
    variables.set("Folder", "C:\\Apps").expect("must set Folder");
    variables.set("Count", 3_i64).expect("must set Count");

    assert_eq!(
        variables.format("INSTALLDIR=\"[Folder]\" COUNT=[Count][Missing]"),
        "INSTALLDIR=\"C:\\Apps\" COUNT=3"
    );
}

#[test]
fn format_keeps_non_references_and_escapes_brackets() {
    let variables = Variables::new();
    assert_eq!(variables.format("[\\[]x[\\]]"), "[x]");
    assert_eq!(variables.format("[not a name]"), "[not a name]");
    assert_eq!(variables.format("open [bracket"), "open [bracket");
}

#[test]
fn format_for_log_masks_hidden_values() {
    let mut variables = Variables::new();
    variables.set("Password", "hunter2").expect("must set Password");
    variables.set_hidden("Password", true);

    assert_eq!(variables.format("pw=[Password]"), "pw=hunter2");
    assert_eq!(variables.format_for_log("pw=[Password]"), "pw=*****");
}

#[test]
fn built_in_variables_reject_authoring() {
    let mut variables = Variables::new();
    variables.set_built_in(VARIABLE_BUNDLE_ACTION, BundleAction::Install.code());
    let err = variables
        .set(VARIABLE_BUNDLE_ACTION, 1_i64)
        .expect_err("built-in must be read-only");
    assert!(matches!(err, VariableError::BuiltIn(_)));
    assert_eq!(variables.get_numeric(VARIABLE_BUNDLE_ACTION), Some(4));
}

#[test]
fn persisted_serialization_skips_session_variables() {
    let mut variables = Variables::new();
    variables
        .set_persisted("InstallFolder", "C:\\Suite")
        .expect("must set InstallFolder");
    variables
        .set_persisted("Build", Variant::Version(pack_version(&[2, 1])))
        .expect("must set Build");
    variables.set("Transient", 1_i64).expect("must set Transient");

    let mut writer = BufferWriter::new();
    variables.serialize(&mut writer);
    let bytes = writer.into_bytes();

    let mut restored = Variables::new();
    restored
        .deserialize(&mut BufferReader::new(&bytes))
        .expect("state must deserialize");
    assert_eq!(restored.get_string("InstallFolder").as_deref(), Some("C:\\Suite"));
    assert_eq!(restored.get_version("Build"), Some(pack_version(&[2, 1])));
    assert!(!restored.contains("Transient"));
}

#[test]
fn full_serialization_keeps_hidden_flags() {
    let mut variables = Variables::new();
    variables.set("Secret", "x").expect("must set Secret");
    variables.set_hidden("Secret", true);
    variables.set("Nothing", Variant::None).expect("must set Nothing");

    let mut writer = BufferWriter::new();
    variables.serialize_all(&mut writer);
    let bytes = writer.into_bytes();

    let restored =
        Variables::deserialize_all(&mut BufferReader::new(&bytes)).expect("must deserialize");
    assert!(restored.is_hidden("Secret"));
    assert_eq!(restored.get("Nothing"), Some(&Variant::None));
}

#[test]
fn unknown_variable_kind_is_rejected() {
    let mut writer = BufferWriter::new();
    writer.write_u32(1).write_string("Bad").write_u32(9);
    let bytes = writer.into_bytes();
    let err = Variables::new()
        .deserialize(&mut BufferReader::new(&bytes))
        .expect_err("unknown kind must fail");
    assert!(matches!(err, VariableError::UnknownKind(9)));
}

const SUITE_MANIFEST: &str = r#"
[bundle]
id = "suite-bundle"
provider_key = "Acme.Suite"
name = "Acme Suite"
version = "2.0.1"
per_machine = true
upgrade_codes = ["{11111111-1111-1111-1111-111111111111}"]

[[variables]]
name = "InstallFolder"
value = "C:\\Acme"
persisted = true

[[variables]]
name = "Level"
value = "3"
type = "numeric"

[[containers]]
id = "Attached"
file = "suite.tar"
attached = true

[[payloads]]
key = "CoreMsi"
file = "core.msi"
size = 2048
container = "Attached"
hash = "0123456789abcdef0123456789abcdef01234567"

[[payloads]]
key = "ToolsExe"
file = "tools.exe"
size = 512
download_url = "https://example.test/tools.exe"
certificate_public_key_id = "aa"

[[rollback_boundaries]]
id = "Core"
vital = false

[[packages]]
id = "Core"
type = "msi"
per_machine = true
product_code = "{22222222-2222-2222-2222-222222222222}"
version = "2.0.1.0"
rollback_boundary = "Core"
payloads = ["CoreMsi"]

[[packages.features]]
id = "Main"
add_local = "Level >= 1"

[[packages.properties]]
id = "INSTALLDIR"
value = "[InstallFolder]"

[[packages.providers]]
key = "Acme.Core"
imported = true

[[packages]]
id = "Tools"
type = "exe"
install_arguments = "/install /quiet"
uninstall_arguments = "/uninstall /quiet"
cache = "always"
payloads = ["ToolsExe"]

[[packages.exit_codes]]
code = 5
behavior = "schedule-reboot"
"#;

#[test]
fn parse_bundle_manifest_into_model() {
    let mut bundle = BundleManifest::from_toml_str(SUITE_MANIFEST)
        .expect("manifest should parse")
        .into_bundle()
        .expect("bundle should build");

    assert_eq!(bundle.registration.bundle_id, "suite-bundle");
    assert_eq!(bundle.registration.version, pack_version(&[2, 0, 1]));
    assert_eq!(bundle.registration.executable_name, "Acme Suite.exe");
    assert_eq!(bundle.packages.len(), 2);

    let core = &bundle.packages[0];
    assert_eq!(core.package_type(), PackageType::Msi);
    assert_eq!(core.cache_id, "Core");
    assert_eq!(core.rollback_boundary, Some(0));
    assert!(!bundle.rollback_boundaries[0].vital);
    assert_eq!(core.size, 2048);
    let PackageKind::Msi(msi) = &core.kind else {
        panic!("Core must be an MSI package");
    };
    assert_eq!(msi.version, pack_version(&[2, 0, 1, 0]));
    assert_eq!(msi.features[0].add_local_condition.as_deref(), Some("Level >= 1"));
    assert_eq!(core.providers[0].key, "Acme.Core");
    assert_eq!(core.owned_providers().count(), 0);

    let core_payload = &bundle.payloads[core.payloads[0]];
    assert_eq!(core_payload.packaging, Packaging::Embedded);
    assert_eq!(core_payload.container, Some(0));
    assert!(bundle.containers[0].primary);

    let tools = &bundle.packages[1];
    assert_eq!(tools.cache_type, CacheType::Always);
    assert_eq!(bundle.payloads[tools.payloads[0]].packaging, Packaging::Download);
    let PackageKind::Exe(exe) = &tools.kind else {
        panic!("Tools must be an EXE package");
    };
    assert_eq!(exe.classify_exit_code(5), ExitCodeKind::ScheduleReboot);
    assert_eq!(exe.classify_exit_code(0), ExitCodeKind::Success);
    assert_eq!(exe.classify_exit_code(1641), ExitCodeKind::ForceReboot);
    assert_eq!(exe.classify_exit_code(2), ExitCodeKind::Error);

    assert_eq!(bundle.variables.get_numeric("Level"), Some(3));
    assert_eq!(
        bundle.variables.get_string(VARIABLE_BUNDLE_NAME).as_deref(),
        Some("Acme Suite")
    );
    assert!(bundle.variables.set(VARIABLE_BUNDLE_VERSION, "1").is_err());
}

#[test]
fn manifest_rejects_duplicate_packages() {
    let duplicated = SUITE_MANIFEST.replace("id = \"Tools\"", "id = \"Core\"");
    let err = BundleManifest::from_toml_str(&duplicated).expect_err("duplicate must fail");
    assert!(err.to_string().contains("duplicate package declaration 'Core'"));
}

#[test]
fn manifest_rejects_unknown_payload_reference() {
    let broken = SUITE_MANIFEST.replace("payloads = [\"ToolsExe\"]", "payloads = [\"Nope\"]");
    let err = BundleManifest::from_toml_str(&broken)
        .expect("manifest should parse")
        .into_bundle()
        .expect_err("unknown payload must fail");
    assert!(format!("{err:#}").contains("unknown payload 'Nope'"));
}

#[test]
fn manifest_rejects_unverifiable_payload() {
    let broken = SUITE_MANIFEST.replace("certificate_public_key_id = \"aa\"", "");
    let err = BundleManifest::from_toml_str(&broken)
        .expect("manifest should parse")
        .into_bundle()
        .expect_err("unverifiable payload must fail");
    assert!(err.to_string().contains("must declare a hash"));
}

#[test]
fn related_msi_version_filters_honor_inclusivity() {
    let related = RelatedMsi {
        upgrade_code: "{x}".to_string(),
        min_version: Some(pack_version(&[1])),
        max_version: Some(pack_version(&[2])),
        min_inclusive: true,
        max_inclusive: false,
        only_detect: false,
    };
    assert!(related.version_in_range(pack_version(&[1])));
    assert!(related.version_in_range(pack_version(&[1, 5])));
    assert!(!related.version_in_range(pack_version(&[2])));
    assert!(!related.version_in_range(pack_version(&[0, 9])));
}

#[test]
fn restart_merge_keeps_strongest() {
    assert_eq!(Restart::None.merge(Restart::Required), Restart::Required);
    assert_eq!(Restart::Initiated.merge(Restart::Required), Restart::Initiated);
    assert_eq!(UiResult::from_code(UiResult::Retry.code()), UiResult::Retry);
}
