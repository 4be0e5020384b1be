//! Append-only editing of `xl/styles.xml`: solid fills and cloned cell formats.

use std::collections::BTreeMap;
use std::io::Write;

use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};

use crate::package::{
    capture_inner_xml, derive_attribute_list, derive_element_prefix, derive_prefixed_tag,
};
use crate::spec::EnumXlsxExportError;

/// One `<xf>` of `<cellXfs>`.
#[derive(Debug, Clone, Default, PartialEq)]
struct SpecCellXf {
    attrs: Vec<(String, String)>,
    inner_xml: String,
}

impl SpecCellXf {
    fn set_attr(&mut self, key: &str, value: String) {
        match self.attrs.iter_mut().find(|(c_key, _)| c_key == key) {
            Some((_, c_value)) => *c_value = value,
            None => self.attrs.push((key.to_string(), value)),
        }
    }
}

/// Cache key of a derived format: base xf, fill id and number format id.
type TupXfKey = (u32, Option<u32>, Option<u32>);

/// Stylesheet with fills and cell formats appended after the template's own.
pub struct XlsxStyles {
    part_name: String,
    xml: String,
    prefix: Option<String>,
    n_fills: Option<u32>,
    l_xfs: Option<Vec<SpecCellXf>>,
    l_fills_added: Vec<String>,
    l_xfs_added: Vec<SpecCellXf>,
    dict_fill_ids: BTreeMap<String, u32>,
    dict_xf_ids: BTreeMap<TupXfKey, u32>,
}

impl XlsxStyles {
    pub fn parse(part_name: &str, xml: &[u8]) -> Result<Self, EnumXlsxExportError> {
        let c_xml = String::from_utf8(xml.to_vec())?;
        let mut prefix = None;
        let mut n_fills = None;
        let mut l_xfs = None;

        {
            let mut reader = Reader::from_str(&c_xml);
            reader.config_mut().trim_text(false);
            let mut if_in_fills = false;
            let mut if_in_cell_xfs = false;
            loop {
                match reader.read_event()? {
                    Event::Eof => break,
                    Event::Start(e) => match e.local_name().as_ref() {
                        b"styleSheet" => prefix = derive_element_prefix(&e)?,
                        b"fills" => {
                            if_in_fills = true;
                            n_fills = Some(0);
                        }
                        b"cellXfs" => {
                            if_in_cell_xfs = true;
                            l_xfs = Some(Vec::new());
                        }
                        b"fill" if if_in_fills => {
                            capture_inner_xml(&mut reader, part_name)?;
                            n_fills = n_fills.map(|n| n + 1);
                        }
                        b"xf" if if_in_cell_xfs => {
                            let attrs = derive_attribute_list(&e)?;
                            let inner_xml = capture_inner_xml(&mut reader, part_name)?;
                            if let Some(l_xfs) = l_xfs.as_mut() {
                                l_xfs.push(SpecCellXf { attrs, inner_xml });
                            }
                        }
                        _ => {}
                    },
                    Event::Empty(e) => match e.local_name().as_ref() {
                        b"fills" => n_fills = Some(0),
                        b"cellXfs" => l_xfs = Some(Vec::new()),
                        b"fill" if if_in_fills => n_fills = n_fills.map(|n| n + 1),
                        b"xf" if if_in_cell_xfs => {
                            let attrs = derive_attribute_list(&e)?;
                            if let Some(l_xfs) = l_xfs.as_mut() {
                                l_xfs.push(SpecCellXf {
                                    attrs,
                                    inner_xml: String::new(),
                                });
                            }
                        }
                        _ => {}
                    },
                    Event::End(e) => match e.local_name().as_ref() {
                        b"fills" => if_in_fills = false,
                        b"cellXfs" => if_in_cell_xfs = false,
                        _ => {}
                    },
                    _ => {}
                }
            }
        }

        Ok(Self {
            part_name: part_name.to_string(),
            xml: c_xml,
            prefix,
            n_fills,
            l_xfs,
            l_fills_added: Vec::new(),
            l_xfs_added: Vec::new(),
            dict_fill_ids: BTreeMap::new(),
            dict_xf_ids: BTreeMap::new(),
        })
    }

    pub fn part_name(&self) -> &str {
        &self.part_name
    }

    /// Whether anything was appended since parsing.
    pub fn is_dirty(&self) -> bool {
        !self.l_fills_added.is_empty() || !self.l_xfs_added.is_empty()
    }

    /// Fill id of a solid ARGB fill, appending it on first use.
    pub fn add_solid_fill(&mut self, argb: &str) -> Result<u32, EnumXlsxExportError> {
        if let Some(n_id) = self.dict_fill_ids.get(argb) {
            return Ok(*n_id);
        }
        let n_fills = self.n_fills.ok_or_else(|| {
            EnumXlsxExportError::InvalidPackage(format!("{}: missing <fills>", self.part_name))
        })?;
        let n_id = n_fills + self.l_fills_added.len() as u32;
        self.l_fills_added.push(argb.to_string());
        self.dict_fill_ids.insert(argb.to_string(), n_id);
        Ok(n_id)
    }

    /// Index of a cell format cloned from `base` with the given fill and number format.
    ///
    /// Unknown base indexes fall back to the default format 0.
    pub fn derive_xf(
        &mut self,
        base: u32,
        fill_id: Option<u32>,
        num_fmt_id: Option<u32>,
    ) -> Result<u32, EnumXlsxExportError> {
        let tup_key = (base, fill_id, num_fmt_id);
        if let Some(n_id) = self.dict_xf_ids.get(&tup_key) {
            return Ok(*n_id);
        }
        let l_xfs = self.l_xfs.as_ref().ok_or_else(|| {
            EnumXlsxExportError::InvalidPackage(format!("{}: missing <cellXfs>", self.part_name))
        })?;
        let n_base = base as usize;
        let mut xf = l_xfs
            .get(n_base)
            .or_else(|| {
                n_base
                    .checked_sub(l_xfs.len())
                    .and_then(|n_idx| self.l_xfs_added.get(n_idx))
            })
            .or_else(|| l_xfs.first())
            .cloned()
            .unwrap_or_default();

        if let Some(n_fill) = fill_id {
            xf.set_attr("fillId", n_fill.to_string());
            xf.set_attr("applyFill", "1".to_string());
        }
        if let Some(n_fmt) = num_fmt_id {
            xf.set_attr("numFmtId", n_fmt.to_string());
            xf.set_attr("applyNumberFormat", "1".to_string());
        }
        for c_key in ["numFmtId", "fontId", "fillId", "borderId"] {
            if !xf.attrs.iter().any(|(c_attr, _)| c_attr == c_key) {
                xf.set_attr(c_key, "0".to_string());
            }
        }

        let n_id = (l_xfs.len() + self.l_xfs_added.len()) as u32;
        self.l_xfs_added.push(xf);
        self.dict_xf_ids.insert(tup_key, n_id);
        Ok(n_id)
    }

    /// Serialize the stylesheet with appended fills and formats and updated counts.
    pub fn to_xml(&self) -> Result<Vec<u8>, EnumXlsxExportError> {
        let n_fills_total = self.n_fills.unwrap_or(0) + self.l_fills_added.len() as u32;
        let n_xfs_total = self.l_xfs.as_ref().map_or(0, Vec::len) + self.l_xfs_added.len();

        let mut reader = Reader::from_str(&self.xml);
        reader.config_mut().trim_text(false);
        let mut writer = Writer::new(Vec::with_capacity(self.xml.len() + 512));
        loop {
            let event = reader.read_event()?;
            let if_start = matches!(event, Event::Start(_));
            match event {
                Event::Eof => break,
                Event::Start(ref e) | Event::Empty(ref e)
                    if e.local_name().as_ref() == b"fills" =>
                {
                    writer.write_event(Event::Start(derive_with_count(e, n_fills_total)?))?;
                    if !if_start {
                        self.write_added_fills(&mut writer)?;
                        writer.write_event(Event::End(e.to_end().into_owned()))?;
                    }
                }
                Event::Start(ref e) | Event::Empty(ref e)
                    if e.local_name().as_ref() == b"cellXfs" =>
                {
                    writer.write_event(Event::Start(derive_with_count(e, n_xfs_total as u32)?))?;
                    if !if_start {
                        self.write_added_xfs(&mut writer)?;
                        writer.write_event(Event::End(e.to_end().into_owned()))?;
                    }
                }
                Event::End(ref e) if e.local_name().as_ref() == b"fills" => {
                    self.write_added_fills(&mut writer)?;
                    writer.write_event(event.clone())?;
                }
                Event::End(ref e) if e.local_name().as_ref() == b"cellXfs" => {
                    self.write_added_xfs(&mut writer)?;
                    writer.write_event(event.clone())?;
                }
                _ => writer.write_event(event)?,
            }
        }
        Ok(writer.into_inner())
    }

    fn write_added_fills(&self, writer: &mut Writer<Vec<u8>>) -> Result<(), EnumXlsxExportError> {
        let c_tag_fill = derive_prefixed_tag(self.prefix.as_deref(), "fill");
        let c_tag_pattern = derive_prefixed_tag(self.prefix.as_deref(), "patternFill");
        for c_argb in &self.l_fills_added {
            writer.write_event(Event::Start(BytesStart::new(c_tag_fill.as_str())))?;
            let mut e_pattern = BytesStart::new(c_tag_pattern.as_str());
            e_pattern.push_attribute(("patternType", "solid"));
            writer.write_event(Event::Start(e_pattern))?;
            for c_local in ["fgColor", "bgColor"] {
                let mut e_color = BytesStart::new(derive_prefixed_tag(self.prefix.as_deref(), c_local));
                e_color.push_attribute(("rgb", c_argb.as_str()));
                writer.write_event(Event::Empty(e_color))?;
            }
            writer.write_event(Event::End(BytesEnd::new(c_tag_pattern.as_str())))?;
            writer.write_event(Event::End(BytesEnd::new(c_tag_fill.as_str())))?;
        }
        Ok(())
    }

    fn write_added_xfs(&self, writer: &mut Writer<Vec<u8>>) -> Result<(), EnumXlsxExportError> {
        let c_tag_xf = derive_prefixed_tag(self.prefix.as_deref(), "xf");
        for xf in &self.l_xfs_added {
            let mut e_xf = BytesStart::new(c_tag_xf.as_str());
            for (c_key, c_value) in &xf.attrs {
                e_xf.push_attribute((c_key.as_str(), c_value.as_str()));
            }
            if xf.inner_xml.is_empty() {
                writer.write_event(Event::Empty(e_xf))?;
            } else {
                writer.write_event(Event::Start(e_xf))?;
                writer.get_mut().write_all(xf.inner_xml.as_bytes())?;
                writer.write_event(Event::End(BytesEnd::new(c_tag_xf.as_str())))?;
            }
        }
        Ok(())
    }
}

/// Copy of `elem` with its `count` attribute set to `count`.
fn derive_with_count(
    elem: &BytesStart<'_>,
    count: u32,
) -> Result<BytesStart<'static>, EnumXlsxExportError> {
    let mut e_out = BytesStart::new(String::from_utf8(elem.name().as_ref().to_vec())?);
    for (c_key, c_value) in derive_attribute_list(elem)? {
        if c_key != "count" {
            e_out.push_attribute((c_key.as_str(), c_value.as_str()));
        }
    }
    let c_count = count.to_string();
    e_out.push_attribute(("count", c_count.as_str()));
    Ok(e_out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const C_STYLES_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><fonts count="1"><font><sz val="11"/><name val="Calibri"/></font></fonts><fills count="2"><fill><patternFill patternType="none"/></fill><fill><patternFill patternType="gray125"/></fill></fills><borders count="1"><border/></borders><cellStyleXfs count="1"><xf numFmtId="0" fontId="0" fillId="0" borderId="0"/></cellStyleXfs><cellXfs count="2"><xf numFmtId="0" fontId="0" fillId="0" borderId="0" xfId="0"/><xf numFmtId="0" fontId="0" fillId="0" borderId="0" xfId="0" applyAlignment="1"><alignment wrapText="1"/></xf></cellXfs><cellStyles count="1"><cellStyle name="Normal" xfId="0" builtinId="0"/></cellStyles></styleSheet>"#;

    #[test]
    fn test_add_fill_and_clone_xf_are_cached() {
        let mut styles = XlsxStyles::parse("xl/styles.xml", C_STYLES_XML.as_bytes()).unwrap();
        assert!(!styles.is_dirty());

        let n_fill = styles.add_solid_fill("FFFFC7CE").unwrap();
        assert_eq!(n_fill, 2);
        assert_eq!(styles.add_solid_fill("FFFFC7CE").unwrap(), 2);

        let n_xf = styles.derive_xf(1, Some(n_fill), None).unwrap();
        assert_eq!(n_xf, 2);
        assert_eq!(styles.derive_xf(1, Some(n_fill), None).unwrap(), 2);
        let n_xf_date = styles.derive_xf(0, None, Some(22)).unwrap();
        assert_eq!(n_xf_date, 3);
        let n_xf_date_fill = styles.derive_xf(n_xf_date, Some(n_fill), None).unwrap();
        assert_eq!(n_xf_date_fill, 4);
        assert!(styles.is_dirty());

        let c_xml = String::from_utf8(styles.to_xml().unwrap()).unwrap();
        assert!(c_xml.contains(r#"<fills count="3">"#));
        assert!(c_xml.contains(
            r#"<fill><patternFill patternType="solid"><fgColor rgb="FFFFC7CE"/><bgColor rgb="FFFFC7CE"/></patternFill></fill></fills>"#
        ));
        assert!(c_xml.contains(r#"<cellXfs count="5">"#));
        assert!(c_xml.contains(
            r#"<xf numFmtId="0" fontId="0" fillId="2" borderId="0" xfId="0" applyAlignment="1" applyFill="1"><alignment wrapText="1"/></xf>"#
        ));
        assert!(c_xml.contains(
            r#"<xf numFmtId="22" fontId="0" fillId="2" borderId="0" xfId="0" applyNumberFormat="1" applyFill="1"/></cellXfs>"#
        ));
        assert!(c_xml.contains(r#"<cellStyleXfs count="1">"#));
    }

    #[test]
    fn test_missing_fills_is_invalid_package() {
        let c_xml = r#"<styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><cellXfs count="1"><xf numFmtId="0"/></cellXfs></styleSheet>"#;
        let mut styles = XlsxStyles::parse("xl/styles.xml", c_xml.as_bytes()).unwrap();
        let err = styles.add_solid_fill("FFFFC7CE").unwrap_err();
        assert!(matches!(err, EnumXlsxExportError::InvalidPackage(_)));
    }
}
