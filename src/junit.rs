//! JUnit XML support for the test launcher.
//!
//! The launcher reads whatever XML the test binary produced (either a
//! `<testsuites>` wrapper, which the build system's default XML uses,
//! or a bare `<testsuite>`), folds per-service test cases into it, and
//! writes the merged document to the real output path. Elements this
//! tool does not understand are skipped, not errors.

use crate::error::{Error, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::io::Cursor;
use std::time::Duration;

pub const FAILURE_REASON_PROPERTY: &str = "failure-reason";
pub const HAS_RACES_REASON: &str = "has-races";
pub const TEST_CASE_TYPE_PROPERTY: &str = "test-type";
pub const SERVICE_TEST_CASE_TYPE: &str = "service";
pub const SVC_START_DURATION_PROPERTY: &str = "svc-start-sec";
pub const CPU_TIME_MS_PROPERTY: &str = "cpu-ms";
pub const RSS_MB_PROPERTY: &str = "rss-mb";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestSuites {
    pub time: String,
    pub suites: Vec<TestSuite>,
    /// Whether the document had a `<testsuites>` wrapper; preserved on
    /// rewrite.
    pub wrapped: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestSuite {
    pub name: String,
    pub errors: i64,
    pub failures: i64,
    pub skips: i64,
    pub tests: i64,
    pub time: String,
    pub test_cases: Vec<TestCase>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestCase {
    pub classname: String,
    pub name: String,
    pub time: String,
    pub failure: Option<FailureDetail>,
    pub error: Option<FailureDetail>,
    pub skipped: Option<String>,
    pub properties: Vec<Property>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FailureDetail {
    pub message: String,
    pub contents: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Property {
    pub name: String,
    pub value: String,
}

impl TestCase {
    pub fn has_failure(&self) -> bool {
        self.failure.is_some()
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }
}

impl TestSuite {
    pub fn has_failing_test(&self) -> bool {
        self.test_cases
            .iter()
            .any(|tc| tc.has_failure() || tc.has_error())
    }
}

impl TestSuites {
    pub fn has_failing_test(&self) -> bool {
        self.suites.iter().any(TestSuite::has_failing_test)
    }
}

/// Build a test case the way the launcher reports services: classname
/// is the test target, name the service.
pub fn generate_test_case(
    class: &str,
    testname: &str,
    duration: Duration,
    failure_message: &str,
    properties: Vec<Property>,
) -> TestCase {
    TestCase {
        classname: class.to_string(),
        name: testname.to_string(),
        time: format!("{:.6}", duration.as_secs_f64()),
        failure: if failure_message.is_empty() {
            None
        } else {
            Some(FailureDetail {
                message: String::new(),
                contents: failure_message.to_string(),
            })
        },
        error: None,
        skipped: None,
        properties,
    }
}

/// Parse a JUnit document with either root form.
pub fn parse(input: &str) -> Result<TestSuites> {
    let mut reader = Reader::from_str(input);
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.name().as_ref() == b"testsuites" => {
                let time = attr_value(&e, b"time")?.unwrap_or_default();
                let mut suites = Vec::new();
                loop {
                    match reader.read_event()? {
                        Event::Start(s) if s.name().as_ref() == b"testsuite" => {
                            suites.push(parse_suite(&mut reader, &s, false)?);
                        }
                        Event::Empty(s) if s.name().as_ref() == b"testsuite" => {
                            suites.push(parse_suite(&mut reader, &s, true)?);
                        }
                        Event::End(end) if end.name().as_ref() == b"testsuites" => break,
                        Event::Eof => {
                            return Err(Error::Xml("unterminated testsuites".to_string()))
                        }
                        _ => {}
                    }
                }
                return Ok(TestSuites {
                    time,
                    suites,
                    wrapped: true,
                });
            }
            Event::Start(e) if e.name().as_ref() == b"testsuite" => {
                let suite = parse_suite(&mut reader, &e, false)?;
                return Ok(TestSuites {
                    time: String::new(),
                    suites: vec![suite],
                    wrapped: false,
                });
            }
            Event::Empty(e) if e.name().as_ref() == b"testsuite" => {
                let suite = parse_suite(&mut reader, &e, true)?;
                return Ok(TestSuites {
                    time: String::new(),
                    suites: vec![suite],
                    wrapped: false,
                });
            }
            Event::Eof => return Err(Error::Xml("no testsuite element found".to_string())),
            _ => {}
        }
    }
}

fn attr_value(e: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr.map_err(|e| Error::Xml(e.to_string()))?;
        if attr.key.as_ref() == key {
            return Ok(Some(
                attr.unescape_value()
                    .map_err(|e| Error::Xml(e.to_string()))?
                    .to_string(),
            ));
        }
    }
    Ok(None)
}

fn parse_i64_attr(e: &BytesStart<'_>, key: &[u8]) -> Result<i64> {
    Ok(attr_value(e, key)?
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(0))
}

fn parse_suite(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart<'_>,
    empty: bool,
) -> Result<TestSuite> {
    let mut suite = TestSuite {
        name: attr_value(start, b"name")?.unwrap_or_default(),
        errors: parse_i64_attr(start, b"errors")?,
        failures: parse_i64_attr(start, b"failures")?,
        skips: parse_i64_attr(start, b"skips")?,
        tests: parse_i64_attr(start, b"tests")?,
        time: attr_value(start, b"time")?.unwrap_or_default(),
        test_cases: Vec::new(),
    };
    if empty {
        return Ok(suite);
    }
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.name().as_ref() == b"testcase" => {
                suite.test_cases.push(parse_testcase(reader, &e, false)?);
            }
            Event::Empty(e) if e.name().as_ref() == b"testcase" => {
                suite.test_cases.push(parse_testcase(reader, &e, true)?);
            }
            Event::Start(e) => {
                // properties, system-out and anything else at suite
                // level is preserved nowhere; skip it whole.
                reader.read_to_end(e.name())?;
            }
            Event::End(e) if e.name().as_ref() == b"testsuite" => break,
            Event::Eof => return Err(Error::Xml("unterminated testsuite".to_string())),
            _ => {}
        }
    }
    Ok(suite)
}

fn parse_testcase(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart<'_>,
    empty: bool,
) -> Result<TestCase> {
    let mut tc = TestCase {
        classname: attr_value(start, b"classname")?.unwrap_or_default(),
        name: attr_value(start, b"name")?.unwrap_or_default(),
        time: attr_value(start, b"time")?.unwrap_or_default(),
        ..TestCase::default()
    };
    if empty {
        return Ok(tc);
    }
    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.name().as_ref() {
                b"failure" => tc.failure = Some(parse_detail(reader, &e, b"failure")?),
                b"error" => tc.error = Some(parse_detail(reader, &e, b"error")?),
                b"skipped" => {
                    tc.skipped = Some(attr_value(&e, b"message")?.unwrap_or_default());
                    reader.read_to_end(e.name())?;
                }
                b"properties" => tc.properties = parse_properties(reader)?,
                _ => {
                    reader.read_to_end(e.name())?;
                }
            },
            Event::Empty(e) => match e.name().as_ref() {
                b"failure" => {
                    tc.failure = Some(FailureDetail {
                        message: attr_value(&e, b"message")?.unwrap_or_default(),
                        contents: String::new(),
                    })
                }
                b"error" => {
                    tc.error = Some(FailureDetail {
                        message: attr_value(&e, b"message")?.unwrap_or_default(),
                        contents: String::new(),
                    })
                }
                b"skipped" => tc.skipped = Some(attr_value(&e, b"message")?.unwrap_or_default()),
                b"property" => {}
                _ => {}
            },
            Event::End(e) if e.name().as_ref() == b"testcase" => break,
            Event::Eof => return Err(Error::Xml("unterminated testcase".to_string())),
            _ => {}
        }
    }
    Ok(tc)
}

fn parse_detail(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart<'_>,
    end_name: &[u8],
) -> Result<FailureDetail> {
    let mut detail = FailureDetail {
        message: attr_value(start, b"message")?.unwrap_or_default(),
        contents: String::new(),
    };
    loop {
        match reader.read_event()? {
            Event::Text(t) => detail
                .contents
                .push_str(&t.unescape().map_err(|e| Error::Xml(e.to_string()))?),
            Event::CData(c) => {
                detail
                    .contents
                    .push_str(&String::from_utf8_lossy(&c.into_inner()))
            }
            Event::End(e) if e.name().as_ref() == end_name => break,
            Event::Eof => return Err(Error::Xml("unterminated failure".to_string())),
            _ => {}
        }
    }
    Ok(detail)
}

fn parse_properties(reader: &mut Reader<&[u8]>) -> Result<Vec<Property>> {
    let mut properties = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Empty(e) | Event::Start(e) if e.name().as_ref() == b"property" => {
                properties.push(Property {
                    name: attr_value(&e, b"name")?.unwrap_or_default(),
                    value: attr_value(&e, b"value")?.unwrap_or_default(),
                });
            }
            Event::End(e) if e.name().as_ref() == b"properties" => break,
            Event::Eof => return Err(Error::Xml("unterminated properties".to_string())),
            _ => {}
        }
    }
    Ok(properties)
}

/// Serialize back to XML with the original root form.
pub fn render(suites: &TestSuites) -> Result<String> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    if suites.wrapped {
        let mut root = BytesStart::new("testsuites");
        root.push_attribute(("time", suites.time.as_str()));
        writer.write_event(Event::Start(root))?;
        for suite in &suites.suites {
            render_suite(&mut writer, suite)?;
        }
        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;
    } else if let Some(suite) = suites.suites.first() {
        render_suite(&mut writer, suite)?;
    }
    String::from_utf8(writer.into_inner().into_inner())
        .map_err(|e| Error::Xml(format!("non-utf8 output: {}", e)))
}

fn render_suite(writer: &mut Writer<Cursor<Vec<u8>>>, suite: &TestSuite) -> Result<()> {
    let mut elem = BytesStart::new("testsuite");
    elem.push_attribute(("errors", suite.errors.to_string().as_str()));
    elem.push_attribute(("failures", suite.failures.to_string().as_str()));
    elem.push_attribute(("name", suite.name.as_str()));
    elem.push_attribute(("skips", suite.skips.to_string().as_str()));
    elem.push_attribute(("tests", suite.tests.to_string().as_str()));
    elem.push_attribute(("time", suite.time.as_str()));
    writer.write_event(Event::Start(elem))?;
    for tc in &suite.test_cases {
        render_testcase(writer, tc)?;
    }
    writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
    Ok(())
}

fn render_testcase(writer: &mut Writer<Cursor<Vec<u8>>>, tc: &TestCase) -> Result<()> {
    let mut elem = BytesStart::new("testcase");
    elem.push_attribute(("classname", tc.classname.as_str()));
    elem.push_attribute(("name", tc.name.as_str()));
    elem.push_attribute(("time", tc.time.as_str()));
    writer.write_event(Event::Start(elem))?;

    if let Some(message) = &tc.skipped {
        let mut skipped = BytesStart::new("skipped");
        skipped.push_attribute(("message", message.as_str()));
        writer.write_event(Event::Empty(skipped))?;
    }
    if let Some(failure) = &tc.failure {
        render_detail(writer, "failure", failure)?;
    }
    if let Some(error) = &tc.error {
        render_detail(writer, "error", error)?;
    }
    if !tc.properties.is_empty() {
        writer.write_event(Event::Start(BytesStart::new("properties")))?;
        for prop in &tc.properties {
            let mut p = BytesStart::new("property");
            p.push_attribute(("name", prop.name.as_str()));
            p.push_attribute(("value", prop.value.as_str()));
            writer.write_event(Event::Empty(p))?;
        }
        writer.write_event(Event::End(BytesEnd::new("properties")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    Ok(())
}

fn render_detail(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    name: &str,
    detail: &FailureDetail,
) -> Result<()> {
    let mut elem = BytesStart::new(name);
    if !detail.message.is_empty() {
        elem.push_attribute(("message", detail.message.as_str()));
    }
    writer.write_event(Event::Start(elem))?;
    writer.write_event(Event::Text(BytesText::new(&detail.contents)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

/// Merge `additional` test cases into `src` (or a fresh suite when the
/// test produced no XML), stamp the suite with the run's total
/// duration, and return the new document.
pub fn overwrite_xml_duration(
    src: Option<&str>,
    total_time: Duration,
    test_target: &str,
    additional: Vec<TestCase>,
) -> Result<String> {
    let mut doc = match src {
        None => TestSuites {
            time: String::new(),
            suites: vec![TestSuite::default()],
            wrapped: false,
        },
        Some(raw) => {
            let mut parsed = parse(raw)?;
            if parsed.wrapped {
                // Service results get their own suite next to whatever
                // the test emitted.
                parsed.suites.push(TestSuite::default());
            }
            parsed
        }
    };

    let suite = doc
        .suites
        .last_mut()
        .ok_or_else(|| Error::Xml("document has no suites".to_string()))?;
    if suite.name.is_empty() {
        suite.name = test_target.to_string();
    }
    suite.time = format!("{:.6}", total_time.as_secs_f64());
    suite.tests += additional.len() as i64;
    for tc in &additional {
        if tc.has_failure() {
            suite.failures += 1;
        }
        if tc.has_error() {
            suite.errors += 1;
        }
        if tc.skipped.is_some() {
            suite.skips += 1;
        }
    }
    suite.test_cases.extend(additional);
    render(&doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SINGLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<testsuite errors="0" failures="1" name="mytest" skips="0" tests="2" time="3.5">
  <testcase classname="mytest" name="passes" time="1.0"></testcase>
  <testcase classname="mytest" name="fails" time="2.5">
    <failure message="boom">stack trace here</failure>
  </testcase>
</testsuite>"#;

    const WRAPPED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<testsuites time="9.0">
  <testsuite errors="0" failures="0" name="suite-a" skips="0" tests="1" time="4.0">
    <testcase classname="suite-a" name="ok" time="4.0"/>
  </testsuite>
</testsuites>"#;

    #[test]
    fn parses_single_suite() {
        let doc = parse(SINGLE).unwrap();
        assert!(!doc.wrapped);
        assert_eq!(doc.suites.len(), 1);
        let suite = &doc.suites[0];
        assert_eq!(suite.name, "mytest");
        assert_eq!(suite.test_cases.len(), 2);
        let failing = &suite.test_cases[1];
        assert_eq!(failing.failure.as_ref().unwrap().message, "boom");
        assert_eq!(failing.failure.as_ref().unwrap().contents, "stack trace here");
        assert!(doc.has_failing_test());
    }

    #[test]
    fn parses_suites_wrapper() {
        let doc = parse(WRAPPED).unwrap();
        assert!(doc.wrapped);
        assert_eq!(doc.time, "9.0");
        assert_eq!(doc.suites[0].test_cases.len(), 1);
        assert!(!doc.has_failing_test());
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(parse("not xml at all").is_err());
        assert!(parse("<other></other>").is_err());
    }

    #[test]
    fn render_roundtrips() {
        let doc = parse(SINGLE).unwrap();
        let rendered = render(&doc).unwrap();
        let again = parse(&rendered).unwrap();
        assert_eq!(doc, again);
    }

    #[test]
    fn merge_into_fresh_document() {
        let tc = generate_test_case(
            "//target",
            "redis",
            Duration::from_millis(1500),
            "Service redis failed",
            vec![Property {
                name: TEST_CASE_TYPE_PROPERTY.to_string(),
                value: SERVICE_TEST_CASE_TYPE.to_string(),
            }],
        );
        let out =
            overwrite_xml_duration(None, Duration::from_secs(10), "//target", vec![tc]).unwrap();
        let doc = parse(&out).unwrap();
        assert_eq!(doc.suites.len(), 1);
        let suite = &doc.suites[0];
        assert_eq!(suite.name, "//target");
        assert_eq!(suite.failures, 1);
        assert_eq!(suite.tests, 1);
        assert!(doc.has_failing_test());
        let case = &suite.test_cases[0];
        assert_eq!(case.property(TEST_CASE_TYPE_PROPERTY), Some("service"));
    }

    #[test]
    fn merge_preserves_existing_cases() {
        let tc = generate_test_case("//t", "svc", Duration::from_secs(1), "", vec![]);
        let out = overwrite_xml_duration(Some(SINGLE), Duration::from_secs(12), "//t", vec![tc])
            .unwrap();
        let doc = parse(&out).unwrap();
        let suite = &doc.suites[0];
        // 2 original cases plus the service case.
        assert_eq!(suite.test_cases.len(), 3);
        assert_eq!(suite.tests, 3);
        assert_eq!(suite.time, format!("{:.6}", 12.0));
        // Existing failure count is untouched by a passing service.
        assert_eq!(suite.failures, 1);
    }

    #[test]
    fn merge_into_wrapper_appends_a_suite() {
        let tc = generate_test_case("//t", "svc", Duration::from_secs(1), "crashed", vec![]);
        let out = overwrite_xml_duration(Some(WRAPPED), Duration::from_secs(20), "//t", vec![tc])
            .unwrap();
        let doc = parse(&out).unwrap();
        assert!(doc.wrapped);
        assert_eq!(doc.suites.len(), 2);
        let added = &doc.suites[1];
        assert_eq!(added.name, "//t");
        assert_eq!(added.failures, 1);
        assert!(doc.has_failing_test());
    }

    #[test]
    fn failure_contents_are_escaped_on_render() {
        let tc = generate_test_case(
            "//t",
            "svc",
            Duration::from_secs(1),
            "exited <1> & said \"no\"",
            vec![],
        );
        let out = overwrite_xml_duration(None, Duration::from_secs(2), "//t", vec![tc]).unwrap();
        let doc = parse(&out).unwrap();
        assert_eq!(
            doc.suites[0].test_cases[0].failure.as_ref().unwrap().contents,
            "exited <1> & said \"no\""
        );
    }
}
