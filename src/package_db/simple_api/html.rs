// Derived from
//   https://github.com/servo/html5ever/blob/master/html5ever/examples/noop-tree-builder.rs
// Which has the following copyright header:
//
// Copyright 2014-2017 The html5ever Project Developers. See the
// COPYRIGHT file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Parses a PEP 503 simple-index project page (the HTML fallback for sources
//! that don't speak the PEP 691 JSON API) into a `ProjectInfo`.

use super::project_info::{ArtifactInfo, DistInfoMetadata, Meta, ProjectInfo, Yanked};
use crate::prelude::*;

use std::borrow::Cow;
use std::collections::HashMap;

use html5ever::tendril::*;
use html5ever::tree_builder::{ElementFlags, NodeOrText, QuirksMode, TreeSink};
use html5ever::{expanded_name, local_name, namespace_url, ns, parse_document};
use html5ever::{Attribute, ExpandedName, LocalNameStaticSet, QualName};
use string_cache::Atom;

const BASE_TAG: ExpandedName = expanded_name!(html "base");
const A_TAG: ExpandedName = expanded_name!(html "a");
const HREF_ATTR: Atom<LocalNameStaticSet> = html5ever::local_name!("href");
static REQUIRES_PYTHON_ATTR: Lazy<Atom<LocalNameStaticSet>> =
    Lazy::new(|| Atom::from("data-requires-python"));
static YANKED_ATTR: Lazy<Atom<LocalNameStaticSet>> = Lazy::new(|| Atom::from("data-yanked"));
static DIST_INFO_METADATA_ATTR: Lazy<Atom<LocalNameStaticSet>> =
    Lazy::new(|| Atom::from("data-dist-info-metadata"));

fn get_attr<'a>(name: &Atom<LocalNameStaticSet>, attrs: &'a [Attribute]) -> Option<&'a str> {
    attrs
        .iter()
        .find(|attr| attr.name.local == *name)
        .map(|attr| attr.value.as_ref())
}

struct Link {
    url: Url,
    requires_python: Option<String>,
    yanked: Option<String>,
    dist_info_metadata: Option<String>,
}

struct Sink {
    next_id: usize,
    names: HashMap<usize, QualName>,
    base: Url,
    changed_base: bool,
    links: Vec<Link>,
}

impl Sink {
    fn get_id(&mut self) -> usize {
        let id = self.next_id;
        self.next_id += 2;
        id
    }
}

impl TreeSink for Sink {
    type Handle = usize;
    type Output = Self;

    fn create_element(&mut self, name: QualName, attrs: Vec<Attribute>, _: ElementFlags) -> usize {
        if name.expanded() == BASE_TAG && !self.changed_base {
            self.changed_base = true;
            if let Some(new_base_str) = get_attr(&HREF_ATTR, &attrs) {
                if let Ok(new_base) = self.base.join(new_base_str) {
                    self.base = new_base;
                }
            }
        }

        if name.expanded() == A_TAG {
            if let Some(url_str) = get_attr(&HREF_ATTR, &attrs) {
                if let Ok(url) = self.base.join(url_str) {
                    self.links.push(Link {
                        url,
                        requires_python: get_attr(&REQUIRES_PYTHON_ATTR, &attrs).map(String::from),
                        yanked: get_attr(&YANKED_ATTR, &attrs).map(String::from),
                        dist_info_metadata: get_attr(&DIST_INFO_METADATA_ATTR, &attrs)
                            .map(String::from),
                    })
                }
            }
        }

        let id = self.get_id();
        self.names.insert(id, name);
        id
    }

    fn finish(self) -> Self {
        self
    }

    fn get_document(&mut self) -> usize {
        0
    }

    fn get_template_contents(&mut self, target: &usize) -> usize {
        target + 1
    }

    fn same_node(&self, x: &usize, y: &usize) -> bool {
        x == y
    }

    fn elem_name(&self, target: &usize) -> ExpandedName {
        self.names.get(target).expect("not an element").expanded()
    }

    fn create_comment(&mut self, _text: StrTendril) -> usize {
        self.get_id()
    }

    fn create_pi(&mut self, _target: StrTendril, _value: StrTendril) -> usize {
        unreachable!()
    }

    fn append_before_sibling(&mut self, _sibling: &usize, _new_node: NodeOrText<usize>) {}

    fn append_based_on_parent_node(
        &mut self,
        _element: &usize,
        _prev_element: &usize,
        _new_node: NodeOrText<usize>,
    ) {
    }

    fn parse_error(&mut self, _msg: Cow<'static, str>) {}
    fn set_quirks_mode(&mut self, _mode: QuirksMode) {}
    fn append(&mut self, _parent: &usize, _child: NodeOrText<usize>) {}

    fn append_doctype_to_document(&mut self, _: StrTendril, _: StrTendril, _: StrTendril) {}
    fn add_attrs_if_missing(&mut self, _target: &usize, _attrs: Vec<Attribute>) {}
    fn remove_from_parent(&mut self, _target: &usize) {}
    fn reparent_children(&mut self, _node: &usize, _new_parent: &usize) {}
    fn mark_script_already_started(&mut self, _node: &usize) {}
}

fn link_to_artifact_info(link: Link) -> Option<ArtifactInfo> {
    let filename = link.url.path_segments()?.next_back()?;
    let name = ArtifactName::try_from(filename).ok()?;
    let hash = link
        .url
        .fragment()
        .and_then(|frag| ArtifactHash::try_from(frag).ok());

    let dist_info_metadata = match link.dist_info_metadata.as_deref() {
        None => DistInfoMetadata::default(),
        Some("true") => DistInfoMetadata {
            available: true,
            hash: None,
        },
        Some("false") => DistInfoMetadata::default(),
        Some(spec) => DistInfoMetadata {
            available: true,
            hash: ArtifactHash::try_from(spec).ok(),
        },
    };

    let yanked = match link.yanked {
        None => Yanked::default(),
        Some(reason) => Yanked {
            yanked: true,
            reason: Some(reason),
        },
    };

    let mut url = link.url;
    url.set_fragment(None);

    Some(ArtifactInfo {
        name,
        url,
        hash,
        requires_python: link.requires_python,
        dist_info_metadata,
        yanked,
    })
}

pub fn parse_html(url: &Url, content_type: &str, body: &[u8]) -> Result<ProjectInfo> {
    if !content_type.starts_with("text/html") {
        bail!(
            "simple API page expected Content-Type: text/html, but got {}",
            content_type
        );
    }

    let sink = Sink {
        next_id: 1,
        base: url.clone(),
        changed_base: false,
        names: HashMap::new(),
        links: Vec::new(),
    };

    let sink = parse_document(sink, Default::default())
        .from_utf8()
        .one(body);

    let artifacts = sink
        .links
        .into_iter()
        .filter_map(link_to_artifact_info)
        .collect();

    Ok(ProjectInfo {
        // PEP 503 pages carry no explicit API version; we treat them as 1.0.
        meta: Meta {
            version: "1.0".to_string(),
        },
        artifacts,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_html_simple_index() {
        let url = Url::parse("https://example.com/simple/foo/").unwrap();
        let body = br#"<html>
            <body>
              <a href="foo-1.0-py3-none-any.whl#sha256=c27c231e66336183c484fbfe080fa6cc954149366c15dc21db8b7290081ec7b8">foo-1.0-py3-none-any.whl</a>
              <a href="foo-0.9.tar.gz" data-yanked="broken build">foo-0.9.tar.gz</a>
              <a href="foo-1.1-py3-none-any.whl" data-requires-python=">=3.8">foo-1.1-py3-none-any.whl</a>
            </body>
          </html>"#;
        let pi = parse_html(&url, "text/html", body).unwrap();
        assert_eq!(pi.artifacts.len(), 3);
        assert!(pi.artifacts[0].hash.is_some());
        assert!(pi.artifacts[1].yanked.yanked);
        assert_eq!(
            pi.artifacts[2].requires_python.as_deref(),
            Some(">=3.8")
        );
    }
}
