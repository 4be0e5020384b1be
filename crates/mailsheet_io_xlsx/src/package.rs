//! OOXML package access: zip parts, workbook relationships and the sheet catalog.
//!
//! Parts are read lazily from the template copy. Rewritten parts are buffered and every
//! untouched entry is raw-copied on save, so its compressed bytes stay identical.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::Path;

use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::spec::EnumXlsxExportError;

pub const C_PART_WORKBOOK: &str = "xl/workbook.xml";
pub const C_PART_WORKBOOK_RELS: &str = "xl/_rels/workbook.xml.rels";
pub const C_PART_CONTENT_TYPES: &str = "[Content_Types].xml";

pub const C_REL_TYPE_SHARED_STRINGS: &str = "/sharedStrings";
pub const C_REL_TYPE_STYLES: &str = "/styles";
pub const C_REL_TYPE_CALC_CHAIN: &str = "/calcChain";

/// One `<Relationship>` of the workbook part, with its target resolved to a part name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecRelationship {
    pub id: String,
    pub rel_type: String,
    pub part_name: String,
}

/// One `<sheet>` of the workbook, in declared order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecSheetEntry {
    pub name: String,
    pub part_name: String,
}

/// Zip-backed workbook package with buffered part rewrites.
pub struct XlsxPackage {
    archive: ZipArchive<Cursor<Vec<u8>>>,
    dict_parts_updated: BTreeMap<String, Vec<u8>>,
    set_parts_dropped: BTreeSet<String>,
}

impl XlsxPackage {
    /// Load the whole package into memory; the file is not kept open.
    pub fn open(path: &Path) -> Result<Self, EnumXlsxExportError> {
        Self::from_bytes(fs::read(path)?)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, EnumXlsxExportError> {
        Ok(Self {
            archive: ZipArchive::new(Cursor::new(bytes))?,
            dict_parts_updated: BTreeMap::new(),
            set_parts_dropped: BTreeSet::new(),
        })
    }

    /// Current bytes of `name`, honoring buffered rewrites and drops.
    pub fn read_part(&mut self, name: &str) -> Result<Option<Vec<u8>>, EnumXlsxExportError> {
        if self.set_parts_dropped.contains(name) {
            return Ok(None);
        }
        if let Some(bytes) = self.dict_parts_updated.get(name) {
            return Ok(Some(bytes.clone()));
        }
        let Some(n_idx) = self.archive.index_for_name(name) else {
            return Ok(None);
        };
        let mut file = self.archive.by_index(n_idx)?;
        let mut buf = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut buf)?;
        Ok(Some(buf))
    }

    pub fn read_required_part(&mut self, name: &str) -> Result<Vec<u8>, EnumXlsxExportError> {
        self.read_part(name)?
            .ok_or_else(|| EnumXlsxExportError::InvalidPackage(format!("missing part {name}")))
    }

    /// Buffer new content for `name`; written on [`Self::save`].
    pub fn write_part(&mut self, name: &str, bytes: Vec<u8>) {
        self.set_parts_dropped.remove(name);
        self.dict_parts_updated.insert(name.to_string(), bytes);
    }

    /// Omit `name` from the saved package.
    pub fn drop_part(&mut self, name: &str) {
        self.dict_parts_updated.remove(name);
        self.set_parts_dropped.insert(name.to_string());
    }

    /// Workbook relationships with targets resolved against `xl/`.
    pub fn read_workbook_relationships(
        &mut self,
    ) -> Result<Vec<SpecRelationship>, EnumXlsxExportError> {
        let Some(bytes) = self.read_part(C_PART_WORKBOOK_RELS)? else {
            return Ok(vec![]);
        };
        parse_relationships(&bytes, "xl")
    }

    /// Part name of the first workbook relationship whose type ends with `rel_type_suffix`.
    pub fn find_workbook_part(
        &mut self,
        rel_type_suffix: &str,
    ) -> Result<Option<String>, EnumXlsxExportError> {
        Ok(self
            .read_workbook_relationships()?
            .into_iter()
            .find(|rel| rel.rel_type.ends_with(rel_type_suffix))
            .map(|rel| rel.part_name))
    }

    /// Worksheets in workbook order.
    pub fn read_sheet_catalog(&mut self) -> Result<Vec<SpecSheetEntry>, EnumXlsxExportError> {
        let v_workbook = self.read_required_part(C_PART_WORKBOOK)?;
        let dict_rels: BTreeMap<String, String> = self
            .read_workbook_relationships()?
            .into_iter()
            .map(|rel| (rel.id, rel.part_name))
            .collect();

        parse_workbook_sheets(&v_workbook)?
            .into_iter()
            .map(|(c_name, c_rel_id)| {
                let part_name = dict_rels.get(&c_rel_id).cloned().ok_or_else(|| {
                    EnumXlsxExportError::InvalidPackage(format!(
                        "sheet {c_name:?} references unknown relationship {c_rel_id:?}"
                    ))
                })?;
                Ok(SpecSheetEntry {
                    name: c_name,
                    part_name,
                })
            })
            .collect()
    }

    /// Shared string table; empty when the workbook has none.
    pub fn read_shared_strings(&mut self) -> Result<Vec<String>, EnumXlsxExportError> {
        let c_part = self
            .find_workbook_part(C_REL_TYPE_SHARED_STRINGS)?
            .unwrap_or_else(|| "xl/sharedStrings.xml".to_string());
        match self.read_part(&c_part)? {
            Some(bytes) => parse_shared_strings(&bytes),
            None => Ok(vec![]),
        }
    }

    /// Remove the calculation chain together with its relationship and content type.
    ///
    /// Returns `false` when the workbook has no calculation chain.
    pub fn drop_calc_chain(&mut self) -> Result<bool, EnumXlsxExportError> {
        let Some(c_part) = self.find_workbook_part(C_REL_TYPE_CALC_CHAIN)? else {
            return Ok(false);
        };
        self.drop_part(&c_part);

        let v_rels = self.read_required_part(C_PART_WORKBOOK_RELS)?;
        let v_rels = remove_xml_elements(&v_rels, b"Relationship", |attrs| {
            attrs
                .get("Type")
                .is_some_and(|c_type| c_type.ends_with(C_REL_TYPE_CALC_CHAIN))
        })?;
        self.write_part(C_PART_WORKBOOK_RELS, v_rels);

        if let Some(v_types) = self.read_part(C_PART_CONTENT_TYPES)? {
            let c_part_abs = format!("/{c_part}");
            let v_types = remove_xml_elements(&v_types, b"Override", |attrs| {
                attrs.get("PartName") == Some(&c_part_abs)
            })?;
            self.write_part(C_PART_CONTENT_TYPES, v_types);
        }
        Ok(true)
    }

    /// Write the package to `path`: rewritten parts are deflated, the rest raw-copied.
    pub fn save(&mut self, path: &Path) -> Result<(), EnumXlsxExportError> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::<()>::default().compression_method(CompressionMethod::Deflated);

        let mut set_written = BTreeSet::new();
        for n_idx in 0..self.archive.len() {
            let file = self.archive.by_index(n_idx)?;
            let c_name = file.name().to_string();
            if self.set_parts_dropped.contains(&c_name) {
                continue;
            }
            if let Some(bytes) = self.dict_parts_updated.get(&c_name) {
                drop(file);
                zip.start_file(c_name.clone(), options)?;
                zip.write_all(bytes)?;
            } else {
                zip.raw_copy_file(file)?;
            }
            set_written.insert(c_name);
        }
        for (c_name, bytes) in &self.dict_parts_updated {
            if set_written.contains(c_name) {
                continue;
            }
            zip.start_file(c_name.clone(), options)?;
            zip.write_all(bytes)?;
        }

        let cursor = zip.finish()?;
        fs::write(path, cursor.into_inner())?;
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////
// #region XmlHelpers

/// Attributes of one element as unescaped `name -> value` (qualified names kept).
pub fn derive_attribute_map(
    elem: &BytesStart<'_>,
) -> Result<BTreeMap<String, String>, EnumXlsxExportError> {
    Ok(derive_attribute_list(elem)?.into_iter().collect())
}

/// Attributes of one element in document order, values unescaped.
pub fn derive_attribute_list(
    elem: &BytesStart<'_>,
) -> Result<Vec<(String, String)>, EnumXlsxExportError> {
    let mut l_attrs = Vec::new();
    for attr in elem.attributes() {
        let attr = attr?;
        l_attrs.push((
            String::from_utf8(attr.key.as_ref().to_vec())?,
            attr.unescape_value()?.into_owned(),
        ));
    }
    Ok(l_attrs)
}

/// Raw XML between the start tag just read and its matching end tag.
pub fn capture_inner_xml(
    reader: &mut Reader<&[u8]>,
    part_name: &str,
) -> Result<String, EnumXlsxExportError> {
    let mut writer = Writer::new(Vec::new());
    let mut n_depth = 1usize;
    loop {
        let event = reader.read_event()?;
        match &event {
            Event::Start(_) => n_depth += 1,
            Event::End(_) => {
                n_depth -= 1;
                if n_depth == 0 {
                    break;
                }
            }
            Event::Eof => {
                return Err(EnumXlsxExportError::InvalidPackage(format!(
                    "{part_name}: unterminated element"
                )));
            }
            _ => {}
        }
        writer.write_event(event)?;
    }
    Ok(String::from_utf8(writer.into_inner())?)
}

/// Whether an XML fragment contains an element with the given local name.
pub fn if_contains_element(xml: &str, local_name: &[u8]) -> bool {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == local_name => {
                return true;
            }
            Ok(Event::Eof) | Err(_) => return false,
            _ => {}
        }
    }
}

/// Namespace prefix of a qualified element name (`x:worksheet -> Some("x")`).
pub fn derive_element_prefix(elem: &BytesStart<'_>) -> Result<Option<String>, EnumXlsxExportError> {
    match elem.name().prefix() {
        Some(prefix) => Ok(Some(String::from_utf8(prefix.as_ref().to_vec())?)),
        None => Ok(None),
    }
}

/// `prefix:local`, or `local` without a prefix.
pub fn derive_prefixed_tag(prefix: Option<&str>, local: &str) -> String {
    match prefix {
        Some(c_prefix) => format!("{c_prefix}:{local}"),
        None => local.to_string(),
    }
}

/// Resolve a relationship target relative to `base_dir` into a package part name.
pub fn derive_part_name_from_target(base_dir: &str, target: &str) -> String {
    let c_target = target.replace('\\', "/");
    if let Some(c_abs) = c_target.strip_prefix('/') {
        return c_abs.to_string();
    }
    let mut l_segments: Vec<&str> = base_dir.split('/').filter(|s| !s.is_empty()).collect();
    for c_segment in c_target.split('/') {
        match c_segment {
            "" | "." => {}
            ".." => {
                l_segments.pop();
            }
            _ => l_segments.push(c_segment),
        }
    }
    l_segments.join("/")
}

fn parse_relationships(
    xml: &[u8],
    base_dir: &str,
) -> Result<Vec<SpecRelationship>, EnumXlsxExportError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut l_rels = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Eof => break,
            Event::Start(ref e) | Event::Empty(ref e)
                if e.local_name().as_ref() == b"Relationship" =>
            {
                let dict_attrs = derive_attribute_map(e)?;
                if dict_attrs.get("TargetMode").map(String::as_str) == Some("External") {
                    buf.clear();
                    continue;
                }
                let (Some(c_id), Some(c_type), Some(c_target)) = (
                    dict_attrs.get("Id"),
                    dict_attrs.get("Type"),
                    dict_attrs.get("Target"),
                ) else {
                    buf.clear();
                    continue;
                };
                l_rels.push(SpecRelationship {
                    id: c_id.clone(),
                    rel_type: c_type.clone(),
                    part_name: derive_part_name_from_target(base_dir, c_target),
                });
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(l_rels)
}

/// `(sheet name, relationship id)` pairs in declared order.
fn parse_workbook_sheets(xml: &[u8]) -> Result<Vec<(String, String)>, EnumXlsxExportError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut l_sheets = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Eof => break,
            Event::Start(ref e) | Event::Empty(ref e) if e.local_name().as_ref() == b"sheet" => {
                let mut c_name = None;
                let mut c_rel_id = None;
                for attr in e.attributes() {
                    let attr = attr?;
                    if attr.key.as_ref() == b"name" {
                        c_name = Some(attr.unescape_value()?.into_owned());
                    } else if attr.key.local_name().as_ref() == b"id"
                        && attr.key.prefix().is_some()
                    {
                        c_rel_id = Some(attr.unescape_value()?.into_owned());
                    }
                }
                match (c_name, c_rel_id) {
                    (Some(c_name), Some(c_rel_id)) => l_sheets.push((c_name, c_rel_id)),
                    _ => {
                        return Err(EnumXlsxExportError::InvalidPackage(
                            "workbook <sheet> without name or r:id".to_string(),
                        ));
                    }
                }
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(l_sheets)
}

/// Plain text of every `<si>`; phonetic runs (`<rPh>`) are skipped.
fn parse_shared_strings(xml: &[u8]) -> Result<Vec<String>, EnumXlsxExportError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut l_strings = Vec::new();
    let mut c_current = String::new();
    let mut if_in_t = false;
    let mut n_depth_rph = 0usize;
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Eof => break,
            Event::Start(ref e) => match e.local_name().as_ref() {
                b"si" => c_current.clear(),
                b"t" => if_in_t = true,
                b"rPh" => n_depth_rph += 1,
                _ => {}
            },
            Event::Empty(ref e) if e.local_name().as_ref() == b"si" => {
                l_strings.push(String::new());
            }
            Event::Text(ref e) if if_in_t && n_depth_rph == 0 => {
                c_current.push_str(&e.unescape()?);
            }
            Event::CData(ref e) if if_in_t && n_depth_rph == 0 => {
                c_current.push_str(&String::from_utf8(e.to_vec())?);
            }
            Event::End(ref e) => match e.local_name().as_ref() {
                b"si" => l_strings.push(std::mem::take(&mut c_current)),
                b"t" => if_in_t = false,
                b"rPh" => n_depth_rph = n_depth_rph.saturating_sub(1),
                _ => {}
            },
            _ => {}
        }
        buf.clear();
    }
    Ok(l_strings)
}

/// Stream-copy `xml`, dropping every `local_name` element whose attributes match.
fn remove_xml_elements(
    xml: &[u8],
    local_name: &[u8],
    fn_match: impl Fn(&BTreeMap<String, String>) -> bool,
) -> Result<Vec<u8>, EnumXlsxExportError> {
    let mut reader = Reader::from_reader(xml);
    let mut writer = Writer::new(Vec::new());
    let mut buf = Vec::new();
    let mut n_skip_depth = 0usize;
    loop {
        let event = reader.read_event_into(&mut buf)?;
        match event {
            Event::Eof => break,
            _ if n_skip_depth > 0 => match event {
                Event::Start(_) => n_skip_depth += 1,
                Event::End(_) => n_skip_depth -= 1,
                _ => {}
            },
            Event::Empty(ref e)
                if e.local_name().as_ref() == local_name && fn_match(&derive_attribute_map(e)?) => {}
            Event::Start(ref e)
                if e.local_name().as_ref() == local_name && fn_match(&derive_attribute_map(e)?) =>
            {
                n_skip_depth = 1;
            }
            _ => writer.write_event(event)?,
        }
        buf.clear();
    }
    Ok(writer.into_inner())
}

// #endregion
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_name_from_target() {
        assert_eq!(
            derive_part_name_from_target("xl", "worksheets/sheet1.xml"),
            "xl/worksheets/sheet1.xml"
        );
        assert_eq!(
            derive_part_name_from_target("xl", "/xl/worksheets/sheet2.xml"),
            "xl/worksheets/sheet2.xml"
        );
        assert_eq!(
            derive_part_name_from_target("xl/worksheets", "../drawings/drawing1.xml"),
            "xl/drawings/drawing1.xml"
        );
    }

    #[test]
    fn test_parse_workbook_sheets_keeps_declared_order() {
        let xml = br#"<?xml version="1.0"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships">
  <sheets>
    <sheet name="Kontakty" sheetId="2" r:id="rId2"/>
    <sheet name="Pomocn&amp;y" sheetId="1" r:id="rId1"/>
  </sheets>
</workbook>"#;
        assert_eq!(
            parse_workbook_sheets(xml).unwrap(),
            vec![
                ("Kontakty".to_string(), "rId2".to_string()),
                ("Pomocn&y".to_string(), "rId1".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_shared_strings_skips_phonetic_runs() {
        let xml = r#"<sst xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" count="3" uniqueCount="3">
<si><t>Jméno</t></si>
<si><r><t>Pří</t></r><r><t xml:space="preserve">jmení </t></r><rPh sb="0" eb="1"><t>x</t></rPh></si>
<si/>
</sst>"#;
        assert_eq!(
            parse_shared_strings(xml.as_bytes()).unwrap(),
            vec!["Jméno".to_string(), "Příjmení ".to_string(), String::new()]
        );
    }

    fn derive_package_bytes(l_parts: &[(&str, &str)]) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::<()>::default().compression_method(CompressionMethod::Deflated);
        for (c_name, c_body) in l_parts {
            zip.start_file(c_name.to_string(), options).unwrap();
            zip.write_all(c_body.as_bytes()).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn test_drop_calc_chain_removes_part_rel_and_override() {
        let v_bytes = derive_package_bytes(&[
            (
                C_PART_CONTENT_TYPES,
                r#"<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Override PartName="/xl/workbook.xml" ContentType="a"/><Override PartName="/xl/calcChain.xml" ContentType="b"/></Types>"#,
            ),
            (
                C_PART_WORKBOOK_RELS,
                r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/><Relationship Id="rId9" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/calcChain" Target="calcChain.xml"/></Relationships>"#,
            ),
            (C_PART_WORKBOOK, "<workbook/>"),
            ("xl/calcChain.xml", "<calcChain/>"),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let path_out = dir.path().join("out.xlsx");

        let mut package = XlsxPackage::from_bytes(v_bytes).unwrap();
        assert!(package.drop_calc_chain().unwrap());
        package.save(&path_out).unwrap();

        let mut package = XlsxPackage::open(&path_out).unwrap();
        assert_eq!(package.read_part("xl/calcChain.xml").unwrap(), None);
        assert_eq!(
            package.read_part(C_PART_WORKBOOK).unwrap(),
            Some(b"<workbook/>".to_vec())
        );
        let l_rels = package.read_workbook_relationships().unwrap();
        assert_eq!(l_rels.len(), 1);
        assert_eq!(l_rels[0].part_name, "xl/worksheets/sheet1.xml");
        let c_types =
            String::from_utf8(package.read_required_part(C_PART_CONTENT_TYPES).unwrap()).unwrap();
        assert!(!c_types.contains("calcChain"));
        assert!(!package.drop_calc_chain().unwrap());
    }

    #[test]
    fn test_remove_xml_elements_drops_matching_override() {
        let xml = br#"<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/calcChain.xml" ContentType="x"/><Override PartName="/xl/workbook.xml" ContentType="y"/></Types>"#;
        let v_out = remove_xml_elements(xml, b"Override", |attrs| {
            attrs.get("PartName").map(String::as_str) == Some("/xl/calcChain.xml")
        })
        .unwrap();
        let c_out = String::from_utf8(v_out).unwrap();
        assert!(!c_out.contains("calcChain"));
        assert!(c_out.contains(r#"PartName="/xl/workbook.xml""#));
        assert!(c_out.contains("<Default "));
    }
}
